//! Publishing a downlink envelope and watching what the network does with it.
use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::downlink_codec::{downlink_topic, DeviceEvent, DownlinkEnvelope, QueueOp};
use crate::error::Result;
use crate::session::{DownlinkTransport, SessionEvent};

/// What was handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedDownlink {
    pub topic: String,
    pub body: String,
}

/// Serialize `envelope` and publish it on the device's downlink topic.
///
/// Fire-and-forget: returns once the client has queued the message. Delivery to the
/// device, if it happens, shows up later as a `down/*` event.
pub async fn publish<T: DownlinkTransport>(
    transport: &T,
    envelope: &DownlinkEnvelope,
    app_id: &str,
    device_id: &str,
    op: QueueOp,
) -> Result<PublishedDownlink> {
    let topic = downlink_topic(app_id, device_id, op);
    let body = envelope.to_json()?;
    match transport.publish(&topic, body.clone().into_bytes()).await {
        Ok(()) => {
            counter!("ttn.downlink.published").increment(1);
            info!(topic = %topic, len = body.len(), confirmed = envelope.is_confirmed(), "downlink published");
            Ok(PublishedDownlink { topic, body })
        }
        Err(e) => {
            counter!("ttn.downlink.publish.err").increment(1);
            warn!(topic = %topic, error = %e, "downlink publish failed");
            Err(e)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// The network reported a final state for the downlink.
    Terminal(DeviceEvent),
    TimedOut,
    /// The session stopped delivering events (e.g. connection dropped).
    Closed,
}

/// Wait until a terminal downlink event arrives or `window` elapses, passing every
/// received message to `on_message`.
pub async fn observe<F>(
    events: &mut mpsc::Receiver<SessionEvent>,
    window: Duration,
    confirmed: bool,
    mut on_message: F,
) -> ObserveOutcome
where
    F: FnMut(&str, &[u8]),
{
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => {
                debug!(window_ms = window.as_millis() as u64, "observation window elapsed");
                return ObserveOutcome::TimedOut;
            }
            ev = events.recv() => {
                match ev {
                    Some(SessionEvent::MessageReceived { topic, payload }) => {
                        on_message(&topic, &payload);
                        let kind = DeviceEvent::from_topic(&topic);
                        debug!(topic = %topic, event = ?kind, "device event");
                        if kind.is_terminal(confirmed) {
                            return ObserveOutcome::Terminal(kind);
                        }
                    }
                    Some(SessionEvent::TransportFailed { detail }) => {
                        warn!(error = %detail, "transport failed while observing");
                        return ObserveOutcome::Closed;
                    }
                    Some(other) => debug!(event = ?other, "ignored while observing"),
                    None => return ObserveOutcome::Closed,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downlink_codec::build_envelope;
    use crate::error::DownlinkError;
    use crate::session::SessionState;
    use bytes::Bytes;
    use std::sync::Mutex;

    struct FakeTransport {
        state: SessionState,
        sent: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl FakeTransport {
        fn new(state: SessionState) -> Self {
            Self { state, sent: Mutex::new(Vec::new()) }
        }
    }

    impl DownlinkTransport for FakeTransport {
        fn state(&self) -> SessionState {
            self.state
        }

        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
            if self.state != SessionState::Connected {
                return Err(DownlinkError::Publish("not connected".into()));
            }
            self.sent.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }
    }

    fn msg(topic: &str) -> SessionEvent {
        SessionEvent::MessageReceived { topic: topic.to_string(), payload: Bytes::from_static(b"{}") }
    }

    #[tokio::test]
    async fn publishes_envelope_json_once() {
        let t = FakeTransport::new(SessionState::Connected);
        let env = build_envelope("00 00 00 00", 1, true).unwrap();
        let out = publish(&t, &env, "foo", "bar", QueueOp::Push).await.expect("published");
        assert_eq!(out.topic, "v3/foo/devices/bar/down/push");

        let sent = t.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "v3/foo/devices/bar/down/push");
        assert_eq!(
            String::from_utf8(sent[0].1.clone()).unwrap(),
            r#"{"downlinks":[{"frm_payload":"AAAAAA==","f_port":1,"priority":"NORMAL","confirmed":true}]}"#
        );
    }

    #[tokio::test]
    async fn replace_uses_replace_topic() {
        let t = FakeTransport::new(SessionState::Connected);
        let env = build_envelope("FF", 5, false).unwrap();
        let out = publish(&t, &env, "foo", "bar", QueueOp::Replace).await.unwrap();
        assert_eq!(out.topic, "v3/foo/devices/bar/down/replace");
    }

    #[tokio::test]
    async fn disconnected_transport_yields_publish_error() {
        let t = FakeTransport::new(SessionState::Disconnected);
        let env = build_envelope("01", 1, true).unwrap();
        let err = publish(&t, &env, "foo", "bar", QueueOp::Push).await.unwrap_err();
        assert!(matches!(err, DownlinkError::Publish(_)));
        assert!(t.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn observe_stops_on_ack() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(msg("v3/foo/devices/bar/down/queued")).await.unwrap();
        tx.send(msg("v3/foo/devices/bar/down/sent")).await.unwrap();
        tx.send(msg("v3/foo/devices/bar/down/ack")).await.unwrap();
        tx.send(msg("v3/foo/devices/bar/up")).await.unwrap();

        let mut seen = Vec::new();
        let outcome = observe(&mut rx, Duration::from_secs(5), true, |topic, _| seen.push(topic.to_string())).await;
        assert_eq!(outcome, ObserveOutcome::Terminal(DeviceEvent::Ack));
        // the trailing uplink is left in the channel
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn unconfirmed_downlink_is_done_when_sent() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(msg("v3/foo/devices/bar/down/sent")).await.unwrap();
        let outcome = observe(&mut rx, Duration::from_secs(5), false, |_, _| {}).await;
        assert_eq!(outcome, ObserveOutcome::Terminal(DeviceEvent::Sent));
    }

    #[tokio::test]
    async fn observe_times_out_without_terminal_event() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(msg("v3/foo/devices/bar/up")).await.unwrap();
        let mut count = 0;
        let outcome = observe(&mut rx, Duration::from_millis(50), true, |_, _| count += 1).await;
        assert_eq!(outcome, ObserveOutcome::TimedOut);
        assert_eq!(count, 1);
        drop(tx);
    }

    #[tokio::test]
    async fn observe_reports_closed_channel() {
        let (tx, mut rx) = mpsc::channel::<SessionEvent>(1);
        drop(tx);
        let outcome = observe(&mut rx, Duration::from_secs(5), true, |_, _| {}).await;
        assert_eq!(outcome, ObserveOutcome::Closed);
    }
}
