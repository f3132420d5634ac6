//! MQTT session against the TTN broker.
//!
//! `rumqttc` only makes progress while its `EventLoop` is polled, so `Session::connect`
//! spawns one task that owns the loop and turns protocol events into `SessionEvent`s on a
//! `tokio::sync::mpsc` channel. The main flow awaits those events instead of relying on
//! callbacks.
//!
//! Lifecycle: `Disconnected -> Connected -> Disconnecting -> Disconnected`. The current
//! state is published through a `tokio::sync::watch` channel shared by the event task and
//! the disconnect path. A refused or failed handshake leaves the session `Disconnected`
//! and the event task exits; there is no reconnect.
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::TtnConfig;
use crate::error::{DownlinkError, Result};

/// Capacity of both the rumqttc request queue and our event channel.
const CHANNEL_CAPACITY: usize = 16;
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// CONNACK outcome. `reason_code` is the MQTT 3.1.1 return code (0 = accepted).
    ConnectionResult { success: bool, reason_code: u8 },
    MessageReceived { topic: String, payload: Bytes },
    /// Network or protocol failure with no CONNACK code attached.
    TransportFailed { detail: String },
}

/// The part of a session the publisher needs. Implemented by `Session` and by test fakes.
#[allow(async_fn_in_trait)]
pub trait DownlinkTransport {
    fn state(&self) -> SessionState;

    /// Hand `payload` to the transport for `topic`. Returns once queued, not once delivered.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Full session lifecycle as driven by `main::run`.
#[allow(async_fn_in_trait)]
pub trait DownlinkSession: DownlinkTransport + Sized {
    /// Wait for the handshake outcome, at most `timeout`.
    async fn wait_connected(&mut self, timeout: Duration) -> Result<()>;

    async fn subscribe(&self, filters: &[String]) -> Result<()>;

    fn events(&mut self) -> &mut mpsc::Receiver<SessionEvent>;

    /// End the session; always returns `Disconnected`.
    async fn disconnect(self) -> SessionState;
}

/// Numeric code and description for a CONNACK return code.
pub fn connack_reason(code: ConnectReturnCode) -> (u8, &'static str) {
    match code {
        ConnectReturnCode::Success => (0, "accepted"),
        ConnectReturnCode::RefusedProtocolVersion => (1, "unacceptable protocol version"),
        ConnectReturnCode::BadClientId => (2, "identifier rejected"),
        ConnectReturnCode::ServiceUnavailable => (3, "server unavailable"),
        ConnectReturnCode::BadUserNamePassword => (4, "bad username or password"),
        ConnectReturnCode::NotAuthorized => (5, "not authorized"),
    }
}

/// Description for a raw return code, as carried in `SessionEvent::ConnectionResult`.
pub fn describe_reason_code(reason_code: u8) -> &'static str {
    match reason_code {
        0 => "accepted",
        1 => "unacceptable protocol version",
        2 => "identifier rejected",
        3 => "server unavailable",
        4 => "bad username or password",
        5 => "not authorized",
        _ => "unknown return code",
    }
}

pub fn mqtt_options(cfg: &TtnConfig) -> MqttOptions {
    let mut opts = MqttOptions::new(cfg.client_id.clone(), cfg.broker_host(), cfg.broker_port);
    opts.set_keep_alive(cfg.keep_alive);
    // TTN authenticates the application id with an API key as password
    opts.set_credentials(cfg.app_id.clone(), cfg.api_key.clone());
    opts
}

pub struct Session {
    client: AsyncClient,
    state: Arc<watch::Sender<SessionState>>,
    events: mpsc::Receiver<SessionEvent>,
    task: JoinHandle<()>,
}

impl Session {
    /// Start connecting. Must be called inside a tokio runtime; the handshake completes
    /// asynchronously and is reported as a `ConnectionResult` event.
    pub fn connect(cfg: &TtnConfig) -> Self {
        info!(host = %cfg.broker_host(), port = cfg.broker_port, username = %cfg.app_id, api_key = %cfg.masked_api_key(), client_id = %cfg.client_id, "connecting to TTN broker");
        let (client, eventloop) = AsyncClient::new(mqtt_options(cfg), CHANNEL_CAPACITY);
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let state = Arc::new(state_tx);
        let (tx, events) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(drive_event_loop(eventloop, state.clone(), tx));
        Session { client, state, events, task }
    }
}

impl DownlinkSession for Session {
    /// Wait for the handshake outcome. The broker sends nothing before CONNACK, so the
    /// first event is the answer.
    async fn wait_connected(&mut self, timeout: Duration) -> Result<()> {
        let outcome = tokio::time::timeout(timeout, self.events.recv()).await;
        match outcome {
            Ok(Some(SessionEvent::ConnectionResult { success: true, .. })) => {
                info!("connected to TTN");
                Ok(())
            }
            Ok(Some(SessionEvent::ConnectionResult { success: false, reason_code })) => {
                counter!("ttn.session.connect.err").increment(1);
                let reason = describe_reason_code(reason_code);
                error!(reason_code, reason, "connection refused");
                Err(DownlinkError::Connection { reason_code, reason })
            }
            Ok(Some(SessionEvent::TransportFailed { detail })) => {
                counter!("ttn.session.connect.err").increment(1);
                error!(error = %detail, "connection failed");
                Err(DownlinkError::Transport(detail))
            }
            Ok(Some(SessionEvent::MessageReceived { topic, .. })) => {
                warn!(topic = %topic, "message before CONNACK");
                Err(DownlinkError::Transport("unexpected message before CONNACK".into()))
            }
            Ok(None) => Err(DownlinkError::Transport("event loop stopped".into())),
            Err(_) => {
                counter!("ttn.session.connect.err").increment(1);
                error!(timeout_ms = timeout.as_millis() as u64, "no CONNACK within timeout");
                Err(DownlinkError::Transport(format!("no CONNACK within {:?}", timeout)))
            }
        }
    }

    /// Subscribe to the given topic filters (device uplinks and downlink events).
    async fn subscribe(&self, filters: &[String]) -> Result<()> {
        for filter in filters {
            self.client
                .subscribe(filter.as_str(), QoS::AtMostOnce)
                .await
                .map_err(|e| DownlinkError::Transport(format!("subscribe {filter}: {e}")))?;
            debug!(filter = %filter, "subscribe requested");
        }
        Ok(())
    }

    fn events(&mut self) -> &mut mpsc::Receiver<SessionEvent> {
        &mut self.events
    }

    /// Send DISCONNECT and wait (bounded) for the event task to exit.
    async fn disconnect(self) -> SessionState {
        let Session { client, state, events, mut task } = self;
        if *state.borrow() == SessionState::Connected {
            state.send_replace(SessionState::Disconnecting);
            if let Err(e) = client.disconnect().await {
                warn!(error = %e, "disconnect request failed");
            }
        }
        // the event task may be blocked on a full channel
        drop(events);
        match tokio::time::timeout(JOIN_TIMEOUT, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "event task ended abnormally"),
            Err(_) => {
                warn!("event task did not stop in time");
                task.abort();
            }
        }
        state.send_replace(SessionState::Disconnected);
        info!("disconnected");
        SessionState::Disconnected
    }
}

impl DownlinkTransport for Session {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let st = self.state();
        if st != SessionState::Connected {
            return Err(DownlinkError::Publish(format!("session is {:?}", st)));
        }
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| DownlinkError::Publish(e.to_string()))
    }
}

async fn drive_event_loop(mut eventloop: EventLoop, state: Arc<watch::Sender<SessionState>>, tx: mpsc::Sender<SessionEvent>) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let (reason_code, reason) = connack_reason(ack.code);
                debug!(reason_code, reason, session_present = ack.session_present, "CONNACK");
                if reason_code == 0 {
                    state.send_replace(SessionState::Connected);
                }
                SessionEvent::ConnectionResult { success: reason_code == 0, reason_code }
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                counter!("ttn.session.messages").increment(1);
                debug!(topic = %p.topic, len = p.payload.len(), "message received");
                SessionEvent::MessageReceived { topic: p.topic, payload: p.payload }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent");
                break;
            }
            Ok(other) => {
                debug!(event = ?other, "mqtt event");
                continue;
            }
            Err(ConnectionError::ConnectionRefused(code)) => {
                let (reason_code, reason) = connack_reason(code);
                warn!(reason_code, reason, "broker refused connection");
                let _ = tx.send(SessionEvent::ConnectionResult { success: false, reason_code }).await;
                break;
            }
            Err(e) => {
                if *state.borrow() == SessionState::Disconnecting {
                    break;
                }
                warn!(error = %e, "mqtt connection error");
                let _ = tx.send(SessionEvent::TransportFailed { detail: e.to_string() }).await;
                break;
            }
        };
        let refused = matches!(event, SessionEvent::ConnectionResult { success: false, .. });
        if tx.send(event).await.is_err() {
            debug!("event receiver dropped");
            break;
        }
        if refused {
            break;
        }
    }
    // a dropped connection that nobody asked for
    if *state.borrow() == SessionState::Connected {
        state.send_replace(SessionState::Disconnected);
    }
}
