use clap::Parser;

use crate::config::Region;
use crate::downlink_codec::{QueueOp, DEFAULT_F_PORT, DEFAULT_PAYLOAD_HEX};

/// Send a downlink to a LoRaWAN device through The Things Network MQTT broker.
///
///   ttn-downlink                     # sends "00 00 00 00" on port 1
///   ttn-downlink "01 FF" 10          # sends 0x01 0xFF on port 10
///
/// Credentials and identifiers come from TTN_APP_ID, TTN_DEVICE_ID, TTN_API_KEY.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Hex payload, bytes may be separated by spaces
    #[arg(default_value = DEFAULT_PAYLOAD_HEX)]
    pub payload: String,

    /// LoRaWAN application port (1-223)
    #[arg(default_value_t = DEFAULT_F_PORT as u16)]
    pub port: u16,

    /// Send without requesting a device acknowledgment
    #[arg(long)]
    pub unconfirmed: bool,

    /// Replace the device's downlink queue instead of appending to it
    #[arg(long)]
    pub replace: bool,

    /// TTN cluster (eu1, nam1, au1); overrides TTN_REGION
    #[arg(long)]
    pub region: Option<Region>,

    /// Seconds to watch for device events after publishing
    #[arg(long, value_name = "SECS")]
    pub wait: Option<u64>,
}

impl Cli {
    pub fn confirmed(&self) -> bool {
        !self.unconfirmed
    }

    pub fn queue_op(&self) -> QueueOp {
        if self.replace {
            QueueOp::Replace
        } else {
            QueueOp::Push
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_arguments_use_defaults() {
        let cli = Cli::try_parse_from(["ttn-downlink"]).unwrap();
        assert_eq!(cli.payload, "00 00 00 00");
        assert_eq!(cli.port, 1);
        assert!(cli.confirmed());
        assert_eq!(cli.queue_op(), QueueOp::Push);
        assert!(cli.region.is_none());
    }

    #[test]
    fn payload_and_port_positionals() {
        let cli = Cli::try_parse_from(["ttn-downlink", "01 FF", "10"]).unwrap();
        assert_eq!(cli.payload, "01 FF");
        assert_eq!(cli.port, 10);
    }

    #[test]
    fn non_integer_port_is_an_input_error() {
        let err = Cli::try_parse_from(["ttn-downlink", "01", "ten"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn flags() {
        let cli = Cli::try_parse_from(["ttn-downlink", "--unconfirmed", "--replace", "--region", "au1", "--wait", "12", "AB"]).unwrap();
        assert!(!cli.confirmed());
        assert_eq!(cli.queue_op(), QueueOp::Replace);
        assert_eq!(cli.region, Some(Region::Au1));
        assert_eq!(cli.wait, Some(12));
        assert_eq!(cli.payload, "AB");
    }

    #[test]
    fn unknown_region_is_rejected() {
        assert!(Cli::try_parse_from(["ttn-downlink", "--region", "mars1"]).is_err());
    }
}
