//! Provider configuration.
//!
//! Every field has a default; a JSON document only needs to name the
//! values it changes:
//!
//! ```
//! use rtls_provider::ProviderConfig;
//!
//! let config = ProviderConfig::from_json_str(r#"{ "stop_timeout_ms": 2000 }"#).unwrap();
//! assert_eq!(config.stop_timeout_ms, 2000);
//! assert_eq!(config.min_report_samples, 10);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::operation::{check_power_level, DEFAULT_POWER_LEVEL};
use crate::error::{Result, RtlsError};
use crate::protocol::DEFAULT_MAX_BUFFERED;
use crate::writer::DEFAULT_CHANNEL_CAPACITY;

/// Tunables of a provider instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Time allowed for a stop to complete before the watchdog forces `Idle`.
    pub stop_timeout_ms: u64,
    /// Pause after setting the stop flag.
    pub stop_settle_ms: u64,
    /// Minimum spacing of proximity reports.
    pub report_interval_ms: u64,
    /// Samples needed before a proximity report.
    pub min_report_samples: u32,
    /// Moving average window of the proximity pipeline.
    pub average_window: usize,
    pub power_level: u8,
    pub back_off: u8,
    /// Send `GetVersion` as soon as the provider starts.
    pub query_version_on_start: bool,
    /// Writer queue capacity.
    pub channel_capacity: usize,
    /// Cap on buffered text without a complete frame.
    pub max_buffered: usize,
    /// Transport read chunk size.
    pub read_buffer_size: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 5000,
            stop_settle_ms: 100,
            report_interval_ms: 1000,
            min_report_samples: 10,
            average_window: 5,
            power_level: DEFAULT_POWER_LEVEL,
            back_off: 0,
            query_version_on_start: true,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_buffered: DEFAULT_MAX_BUFFERED,
            read_buffer_size: 4096,
        }
    }
}

impl ProviderConfig {
    /// Parse a JSON object; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        check_power_level(self.power_level)?;
        if self.channel_capacity == 0 {
            return Err(RtlsError::InvalidParameter(
                "channel_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn stop_settle(&self) -> Duration {
        Duration::from_millis(self.stop_settle_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProviderConfig::default();
        assert_eq!(config.stop_timeout(), Duration::from_secs(5));
        assert_eq!(config.report_interval(), Duration::from_secs(1));
        assert!(config.query_version_on_start);
    }

    #[test]
    fn test_partial_json() {
        let config =
            ProviderConfig::from_json_str(r#"{"back_off": 4, "query_version_on_start": false}"#)
                .unwrap();
        assert_eq!(config.back_off, 4);
        assert!(!config.query_version_on_start);
        assert_eq!(config.stop_settle_ms, 100);
    }

    #[test]
    fn test_invalid_power_level() {
        let err = ProviderConfig::from_json_str(r#"{"power_level": 99}"#).unwrap_err();
        assert!(matches!(err, RtlsError::InvalidParameter(_)));
    }

    #[test]
    fn test_zero_channel_capacity() {
        let err = ProviderConfig::from_json_str(r#"{"channel_capacity": 0}"#).unwrap_err();
        assert!(matches!(err, RtlsError::InvalidParameter(_)));
    }

    #[test]
    fn test_wrong_type() {
        let err = ProviderConfig::from_json_str(r#"{"power_level": "high"}"#).unwrap_err();
        assert!(matches!(err, RtlsError::Json(_)));
    }
}
