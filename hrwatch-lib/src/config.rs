//! Timeouts and delays of a watch session.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Session timing parameters, all in milliseconds
///
/// Every field has a default, so a config file only needs to name what it changes:
///
/// ```json
/// { "lookup_timeout_ms": 20000 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Wait for each handshake response
    pub auth_timeout_ms: u64,
    /// Wait for the whole lookup phase
    pub lookup_timeout_ms: u64,
    /// Lower bound of the encrypted get deadline
    pub get_timeout_min_ms: u64,
    /// Upper bound of the encrypted get deadline
    pub get_timeout_max_ms: u64,
    /// Slowest transfer rate still considered healthy, used to scale the get deadline
    pub min_throughput_bps: u64,
    /// Pause between the lookup completion and the get request
    pub settle_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_timeout_ms: 10_000,
            lookup_timeout_ms: 15_000,
            get_timeout_min_ms: 20_000,
            get_timeout_max_ms: 60_000,
            min_throughput_bps: 1024,
            settle_delay_ms: 50,
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.get_timeout_min_ms > self.get_timeout_max_ms {
            return Err(ConfigError::Invalid(format!(
                "get_timeout_min_ms ({}) exceeds get_timeout_max_ms ({})",
                self.get_timeout_min_ms, self.get_timeout_max_ms
            )));
        }
        if self.min_throughput_bps == 0 {
            return Err(ConfigError::Invalid("min_throughput_bps must be positive".to_string()));
        }
        Ok(())
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Deadline for the get phase of a file of `file_size` bytes
    ///
    /// The minimum plus the time the file takes at `min_throughput_bps`,
    /// clamped to the configured maximum.
    pub fn get_timeout(&self, file_size: u32) -> Duration {
        let throughput = self.min_throughput_bps.max(1);
        let transfer_ms = u64::from(file_size).saturating_mul(1000) / throughput;
        let ms = self
            .get_timeout_min_ms
            .saturating_add(transfer_ms)
            .min(self.get_timeout_max_ms.max(self.get_timeout_min_ms));
        Duration::from_millis(ms)
    }
}
