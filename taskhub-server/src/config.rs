use std::time::Duration;

use taskhub_sync::HubConfig;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} has invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Process configuration, read from the environment after `.env` is loaded.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// REST listener
    pub http_addr: String,
    pub hub: HubConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:3000".to_string(),
            hub: HubConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads `PORT`, `HUB_ADDR`, `HEARTBEAT_INTERVAL_SECS` and
    /// `HUB_OUTBOUND_CAPACITY`; anything unset keeps its default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(port) = lookup("PORT") {
            let port: u16 = parse("PORT", &port)?;
            config.http_addr = format!("0.0.0.0:{port}");
        }
        if let Some(addr) = lookup("HUB_ADDR") {
            config.hub.bind_addr = addr;
        }
        if let Some(secs) = lookup("HEARTBEAT_INTERVAL_SECS") {
            let secs: u64 = parse("HEARTBEAT_INTERVAL_SECS", &secs)?;
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    var: "HEARTBEAT_INTERVAL_SECS",
                    value: secs.to_string(),
                });
            }
            config.hub.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(capacity) = lookup("HUB_OUTBOUND_CAPACITY") {
            let capacity: usize = parse("HUB_OUTBOUND_CAPACITY", &capacity)?;
            if capacity == 0 {
                return Err(ConfigError::Invalid {
                    var: "HUB_OUTBOUND_CAPACITY",
                    value: capacity.to_string(),
                });
            }
            config.hub.outbound_capacity = capacity;
        }
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}
