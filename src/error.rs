use thiserror::Error;

use crate::downlink_codec::PayloadError;

#[derive(Debug, Error)]
pub enum DownlinkError {
    #[error("invalid payload: {0}")]
    InvalidPayload(PayloadError),
    #[error("invalid port: f_port {0} outside 1..=223")]
    InvalidPort(u16),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("connection refused by broker (code {reason_code}): {reason}")]
    Connection { reason_code: u8, reason: &'static str },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DownlinkError>;

impl From<PayloadError> for DownlinkError {
    fn from(e: PayloadError) -> Self {
        match e {
            PayloadError::PortOutOfRange(port) => DownlinkError::InvalidPort(port),
            other => DownlinkError::InvalidPayload(other),
        }
    }
}
