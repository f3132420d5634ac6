//! Connection settings for the TTN MQTT broker.
//!
//! Values come from `TTN_*` environment variables and fall back to the compiled-in
//! defaults below. The CLI may then override the region and the observation window.
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::DownlinkError;

pub const DEFAULT_APP_ID: &str = "tu_app_id";
pub const DEFAULT_DEVICE_ID: &str = "tu_device_id";
pub const DEFAULT_API_KEY: &str = "tu_api_key";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_OBSERVE_SECS: u64 = 5;

/// TTN cloud cluster the application is registered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Region {
    #[default]
    Eu1,
    Nam1,
    Au1,
}

impl Region {
    pub fn as_str(self) -> &'static str {
        match self {
            Region::Eu1 => "eu1",
            Region::Nam1 => "nam1",
            Region::Au1 => "au1",
        }
    }

    pub fn broker_host(self) -> String {
        format!("{}.cloud.thethings.network", self.as_str())
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = DownlinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eu1" => Ok(Region::Eu1),
            "nam1" => Ok(Region::Nam1),
            "au1" => Ok(Region::Au1),
            other => Err(DownlinkError::Config(format!("unknown region {:?} (expected eu1, nam1 or au1)", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TtnConfig {
    pub app_id: String,
    pub device_id: String,
    pub api_key: String,
    pub region: Region,
    /// Overrides the regional host, e.g. for a local broker.
    pub broker_host: Option<String>,
    pub broker_port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub observe_window: Duration,
}

impl TtnConfig {
    pub fn from_env() -> Result<Self, DownlinkError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup so tests don't have to touch the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DownlinkError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let app_id = lookup("TTN_APP_ID").unwrap_or_else(|| DEFAULT_APP_ID.to_string());
        let device_id = lookup("TTN_DEVICE_ID").unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string());
        let api_key = lookup("TTN_API_KEY").unwrap_or_else(|| DEFAULT_API_KEY.to_string());
        let region = match lookup("TTN_REGION") {
            Some(r) => r.parse()?,
            None => Region::default(),
        };
        let broker_host = lookup("TTN_MQTT_HOST").filter(|h| !h.trim().is_empty());
        let broker_port = match lookup("TTN_MQTT_PORT") {
            Some(p) => p.trim().parse::<u16>().map_err(|e| DownlinkError::Config(format!("TTN_MQTT_PORT {:?}: {e}", p)))?,
            None => DEFAULT_MQTT_PORT,
        };
        let client_id = lookup("TTN_CLIENT_ID").unwrap_or_else(|| format!("{}-downlink", device_id));
        let cfg = Self {
            app_id,
            device_id,
            api_key,
            region,
            broker_host,
            broker_port,
            client_id,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            observe_window: Duration::from_secs(DEFAULT_OBSERVE_SECS),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), DownlinkError> {
        for (name, value) in [("application id", &self.app_id), ("device id", &self.device_id)] {
            if value.is_empty() {
                return Err(DownlinkError::Config(format!("{name} must not be empty")));
            }
            // these would change the meaning of the topic
            if value.contains(['/', '+', '#']) {
                return Err(DownlinkError::Config(format!("{name} {:?} contains a topic separator or wildcard", value)));
            }
        }
        if self.api_key.is_empty() {
            return Err(DownlinkError::Config("api key must not be empty".into()));
        }
        Ok(())
    }

    pub fn broker_host(&self) -> String {
        match &self.broker_host {
            Some(host) => host.clone(),
            None => self.region.broker_host(),
        }
    }

    /// API key with everything but the first and last 4 characters hidden.
    pub fn masked_api_key(&self) -> String {
        let k = &self.api_key;
        if k.len() <= 8 || !k.is_ascii() {
            return "****".to_string();
        }
        format!("{}..{}", &k[..4], &k[k.len() - 4..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let cfg = TtnConfig::from_lookup(|_| None).expect("defaults are valid");
        assert_eq!(cfg.app_id, DEFAULT_APP_ID);
        assert_eq!(cfg.region, Region::Eu1);
        assert_eq!(cfg.broker_host(), "eu1.cloud.thethings.network");
        assert_eq!(cfg.broker_port, 1883);
        assert_eq!(cfg.observe_window, Duration::from_secs(5));
    }

    #[test]
    fn env_overrides() {
        let cfg = TtnConfig::from_lookup(lookup_from(&[
            ("TTN_APP_ID", "foo"),
            ("TTN_DEVICE_ID", "bar"),
            ("TTN_API_KEY", "NNSXS.ABCDEFGHIJ"),
            ("TTN_REGION", "NAM1"),
            ("TTN_MQTT_PORT", "1884"),
        ]))
        .expect("valid");
        assert_eq!(cfg.broker_host(), "nam1.cloud.thethings.network");
        assert_eq!(cfg.broker_port, 1884);
        assert_eq!(cfg.client_id, "bar-downlink");
        assert_eq!(cfg.masked_api_key(), "NNSX..GHIJ");
    }

    #[test]
    fn host_override_wins_over_region() {
        let cfg = TtnConfig::from_lookup(lookup_from(&[("TTN_REGION", "au1"), ("TTN_MQTT_HOST", "127.0.0.1")])).unwrap();
        assert_eq!(cfg.broker_host(), "127.0.0.1");
        let cfg = TtnConfig::from_lookup(lookup_from(&[("TTN_REGION", "au1"), ("TTN_MQTT_HOST", " ")])).unwrap();
        assert_eq!(cfg.broker_host(), "au1.cloud.thethings.network");
    }

    #[test]
    fn region_parsing() {
        assert_eq!("au1".parse::<Region>().unwrap(), Region::Au1);
        assert_eq!(" Eu1 ".parse::<Region>().unwrap(), Region::Eu1);
        assert!("us-west".parse::<Region>().is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(TtnConfig::from_lookup(lookup_from(&[("TTN_MQTT_PORT", "abc")])).is_err());
        assert!(TtnConfig::from_lookup(lookup_from(&[("TTN_DEVICE_ID", "")])).is_err());
        assert!(TtnConfig::from_lookup(lookup_from(&[("TTN_APP_ID", "a/b")])).is_err());
        assert!(TtnConfig::from_lookup(lookup_from(&[("TTN_DEVICE_ID", "dev#")])).is_err());
    }

    #[test]
    fn short_keys_are_fully_masked() {
        let cfg = TtnConfig::from_lookup(lookup_from(&[("TTN_API_KEY", "short")])).unwrap();
        assert_eq!(cfg.masked_api_key(), "****");
    }
}
