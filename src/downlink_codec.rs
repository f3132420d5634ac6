//! TTN v3 downlink codec (payload parsing, envelope building, topic layout).
//!
//! The Things Stack accepts downlinks over MQTT as a JSON document holding a list of
//! downlink objects. This module handles:
//! - Hex payload parsing (whitespace tolerant, e.g. `"00 00 00 00"`).
//! - Construction of the `{"downlinks":[...]}` envelope with a base64 `frm_payload`.
//! - Topic strings for push/replace and for the per-device event topics we subscribe to.
//! - Classification of inbound topics into downlink lifecycle events.
//!
//! Kept free of crate-level imports so `src/bin/encode_downlink.rs` can pull it in by path.
use base64::Engine; // bring trait in scope for encode/decode
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Payload used when the CLI is invoked without arguments.
pub const DEFAULT_PAYLOAD_HEX: &str = "00 00 00 00";
/// Port used when the CLI is invoked without a port argument.
pub const DEFAULT_F_PORT: u8 = 1;
/// LoRaWAN application ports are 1..=223; 0 is MAC-only and 224+ are reserved.
pub const F_PORT_MIN: u8 = 1;
pub const F_PORT_MAX: u8 = 223;
/// Scheduling priority. Fixed for now.
pub const PRIORITY_NORMAL: &str = "NORMAL";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("hex payload has odd length ({0} digits)")]
    OddLength(usize),
    #[error("invalid hex character {c:?} at index {index}")]
    InvalidCharacter { c: char, index: usize },
    #[error("f_port {0} outside 1..=223")]
    PortOutOfRange(u16),
}

/// A single downlink as typed on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownlinkRequest {
    pub payload: Vec<u8>,
    pub port: u8,
    pub confirmed: bool,
}

impl DownlinkRequest {
    pub fn from_hex(hex_payload: &str, port: u16, confirmed: bool) -> Result<Self, PayloadError> {
        let payload = parse_hex_payload(hex_payload)?;
        let port = validate_port(port)?;
        Ok(Self { payload, port, confirmed })
    }

    pub fn to_envelope(&self) -> DownlinkEnvelope {
        DownlinkEnvelope {
            downlinks: vec![Downlink {
                frm_payload: base64::engine::general_purpose::STANDARD.encode(&self.payload),
                f_port: self.port,
                priority: PRIORITY_NORMAL,
                confirmed: self.confirmed,
            }],
        }
    }
}

/// Wire object published on `.../down/push`. Field order matches the TTN examples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownlinkEnvelope {
    pub downlinks: Vec<Downlink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Downlink {
    pub frm_payload: String,
    pub f_port: u8,
    pub priority: &'static str,
    pub confirmed: bool,
}

impl DownlinkEnvelope {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Whether the (single) downlink asks the device for an acknowledgment.
    pub fn is_confirmed(&self) -> bool {
        self.downlinks.iter().any(|d| d.confirmed)
    }
}

/// Strip whitespace and decode hex pairs into bytes.
pub fn parse_hex_payload(hex_payload: &str) -> Result<Vec<u8>, PayloadError> {
    let compact: String = hex_payload.chars().filter(|c| !c.is_whitespace()).collect();
    debug!(input_len = hex_payload.len(), compact_len = compact.len(), "parse_hex_payload");
    // hex reports bytes; find the offending char ourselves so non-ASCII input reads right
    if let Some((index, c)) = compact.chars().enumerate().find(|(_, c)| !c.is_ascii_hexdigit()) {
        return Err(PayloadError::InvalidCharacter { c, index });
    }
    hex::decode(&compact).map_err(|e| match e {
        hex::FromHexError::InvalidHexCharacter { c, index } => PayloadError::InvalidCharacter { c, index },
        hex::FromHexError::OddLength | hex::FromHexError::InvalidStringLength => PayloadError::OddLength(compact.len()),
    })
}

pub fn validate_port(port: u16) -> Result<u8, PayloadError> {
    match u8::try_from(port) {
        Ok(p) if (F_PORT_MIN..=F_PORT_MAX).contains(&p) => Ok(p),
        _ => Err(PayloadError::PortOutOfRange(port)),
    }
}

/// Build the downlink envelope for a hex payload. No side effects.
pub fn build_envelope(hex_payload: &str, port: u16, confirmed: bool) -> Result<DownlinkEnvelope, PayloadError> {
    let req = DownlinkRequest::from_hex(hex_payload, port, confirmed)?;
    debug!(payload = %hex::encode(&req.payload), f_port = req.port, confirmed, "build_envelope");
    Ok(req.to_envelope())
}

/// Decode a `frm_payload` back to raw bytes.
pub fn decode_frm_payload(frm_payload: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(frm_payload.as_bytes())
}

/// How the downlink is handed to the network server's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueOp {
    /// Append to the device's downlink queue.
    #[default]
    Push,
    /// Drop whatever is queued and replace it with this downlink.
    Replace,
}

impl QueueOp {
    fn suffix(self) -> &'static str {
        match self {
            QueueOp::Push => "push",
            QueueOp::Replace => "replace",
        }
    }
}

fn device_prefix(app_id: &str, device_id: &str) -> String {
    format!("v3/{}/devices/{}", app_id, device_id)
}

pub fn downlink_topic(app_id: &str, device_id: &str, op: QueueOp) -> String {
    format!("{}/down/{}", device_prefix(app_id, device_id), op.suffix())
}

/// `v3/{app}/devices/{dev}/down/push`
pub fn push_topic(app_id: &str, device_id: &str) -> String {
    downlink_topic(app_id, device_id, QueueOp::Push)
}

/// Topic filters for the device's uplinks and downlink lifecycle events.
pub fn event_topic_filters(app_id: &str, device_id: &str) -> Vec<String> {
    let prefix = device_prefix(app_id, device_id);
    vec![format!("{}/up", prefix), format!("{}/down/+", prefix)]
}

/// What an inbound message on a device topic means for the downlink we sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Uplink,
    Queued,
    Sent,
    Ack,
    Nack,
    Failed,
    Other,
}

impl DeviceEvent {
    pub fn from_topic(topic: &str) -> Self {
        let mut parts = topic.rsplit('/');
        match (parts.next(), parts.next()) {
            (Some("up"), _) => DeviceEvent::Uplink,
            (Some("queued"), Some("down")) => DeviceEvent::Queued,
            (Some("sent"), Some("down")) => DeviceEvent::Sent,
            (Some("ack"), Some("down")) => DeviceEvent::Ack,
            (Some("nack"), Some("down")) => DeviceEvent::Nack,
            (Some("failed"), Some("down")) => DeviceEvent::Failed,
            _ => DeviceEvent::Other,
        }
    }

    /// True once nothing further will happen to the downlink.
    /// An unconfirmed downlink is done once the gateway has transmitted it.
    pub fn is_terminal(self, confirmed: bool) -> bool {
        match self {
            DeviceEvent::Ack | DeviceEvent::Nack | DeviceEvent::Failed => true,
            DeviceEvent::Sent => !confirmed,
            _ => false,
        }
    }
}
