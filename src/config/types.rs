use std::time::Duration;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::{parse_identifier, CONNECTION_POLL_DELAY, SCAN_TIMEOUT};
use crate::error::DriverError;

/// Which peripheral to talk to. Every field that is set must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeripheralSelector {
    pub name: Option<String>,
    pub address: Option<String>,
    /// Services the peripheral must advertise.
    pub services: Vec<String>,
}

impl PeripheralSelector {
    pub fn service_uuids(&self) -> Result<Vec<Uuid>, DriverError> {
        self.services.iter().map(|service| parse_identifier(service)).collect()
    }

    pub fn matches(&self, name: Option<&str>, address: &str, advertised: &[Uuid], services: &[Uuid]) -> bool {
        if let Some(wanted) = &self.name {
            if name != Some(wanted.as_str()) {
                return false;
            }
        }

        if let Some(wanted) = &self.address {
            if !wanted.eq_ignore_ascii_case(address) {
                return false;
            }
        }

        services.iter().all(|service| advertised.contains(service))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub peripheral: PeripheralSelector,
    pub scan_timeout_ms: u64,
    pub connection_poll_ms: u64,
    pub log_level: String,
}

impl Config {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connection_poll(&self) -> Duration {
        Duration::from_millis(self.connection_poll_ms)
    }

    pub fn log_level_filter(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::Info)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            peripheral: PeripheralSelector::default(),
            scan_timeout_ms: SCAN_TIMEOUT,
            connection_poll_ms: CONNECTION_POLL_DELAY,
            log_level: String::from("info"),
        }
    }
}
