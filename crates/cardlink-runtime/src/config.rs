//! Runtime configuration.
//!
//! [`PlatformConfig`] holds the tunables of a [`Platform`](crate::Platform):
//! channel capacities, GET RESPONSE chaining bound, the PC/SC polling interval
//! and how long a forced release waits for each device. Every field has a
//! default, so a partial JSON document is enough:
//!
//! ```
//! use cardlink_runtime::PlatformConfig;
//!
//! let config = PlatformConfig::from_json(r#"{ "event_capacity": 64 }"#).unwrap();
//! assert_eq!(config.event_capacity, 64);
//! assert_eq!(config.max_chained_responses, PlatformConfig::default().max_chained_responses);
//! ```

use std::time::Duration;

use cardlink_core::constants::{
    DEFAULT_EVENT_CAPACITY, DEFAULT_MAX_CHAINED_RESPONSES, DEFAULT_PCSC_POLL_INTERVAL_MS,
    DEFAULT_PRESENCE_CAPACITY, DEFAULT_RELEASE_TIMEOUT_MS,
};
use cardlink_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Platform tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlatformConfig {
    /// Undelivered events retained per subscriber before the oldest are dropped.
    pub event_capacity: usize,

    /// Presence signals buffered between a transport and its device.
    pub presence_channel_capacity: usize,

    /// Upper bound on GET RESPONSE / wrong-Le retries for one chained transmit.
    pub max_chained_responses: usize,

    /// How long the PC/SC monitor blocks in one status-change call.
    pub pcsc_poll_interval_ms: u64,

    /// Per-device deadline when releasing devices in bulk.
    pub release_timeout_ms: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            presence_channel_capacity: DEFAULT_PRESENCE_CAPACITY,
            max_chained_responses: DEFAULT_MAX_CHAINED_RESPONSES,
            pcsc_poll_interval_ms: DEFAULT_PCSC_POLL_INTERVAL_MS,
            release_timeout_ms: DEFAULT_RELEASE_TIMEOUT_MS,
        }
    }
}

impl PlatformConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Errors
    ///
    /// `INVALID_PARAMETER` if the document is malformed, names an unknown
    /// field, or fails [`validate`](Self::validate).
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::invalid_parameter(format!("invalid platform config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_presence_channel_capacity(mut self, capacity: usize) -> Self {
        self.presence_channel_capacity = capacity;
        self
    }

    pub fn with_max_chained_responses(mut self, max: usize) -> Self {
        self.max_chained_responses = max;
        self
    }

    pub fn with_pcsc_poll_interval(mut self, interval: Duration) -> Self {
        self.pcsc_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn pcsc_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pcsc_poll_interval_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }

    /// Check that every value is usable.
    ///
    /// # Errors
    ///
    /// `INVALID_PARAMETER` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("event_capacity", self.event_capacity as u64),
            ("presence_channel_capacity", self.presence_channel_capacity as u64),
            ("pcsc_poll_interval_ms", self.pcsc_poll_interval_ms),
            ("release_timeout_ms", self.release_timeout_ms),
        ];

        for (field, value) in checks {
            if value == 0 {
                return Err(Error::invalid_parameter(format!(
                    "{field} must be greater than zero"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardlink_core::ErrorKind;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        let config = PlatformConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
        assert_eq!(config.release_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_builders() {
        let config = PlatformConfig::default()
            .with_event_capacity(16)
            .with_presence_channel_capacity(4)
            .with_max_chained_responses(0)
            .with_pcsc_poll_interval(Duration::from_millis(50))
            .with_release_timeout(Duration::from_millis(750));

        assert_eq!(config.event_capacity, 16);
        assert_eq!(config.presence_channel_capacity, 4);
        assert_eq!(config.max_chained_responses, 0);
        assert_eq!(config.pcsc_poll_interval(), Duration::from_millis(50));
        assert_eq!(config.release_timeout_ms, 750);
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case(PlatformConfig::default().with_event_capacity(0), "event_capacity")]
    #[case(
        PlatformConfig::default().with_presence_channel_capacity(0),
        "presence_channel_capacity"
    )]
    #[case(
        PlatformConfig::default().with_release_timeout(Duration::ZERO),
        "release_timeout_ms"
    )]
    fn test_validate_rejects_zero(#[case] config: PlatformConfig, #[case] field: &str) {
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        assert!(err.message().contains(field));
    }

    #[test]
    fn test_from_json_partial() {
        let config = PlatformConfig::from_json(r#"{ "release_timeout_ms": 100 }"#).unwrap();
        assert_eq!(config.release_timeout_ms, 100);
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
    }

    #[rstest]
    #[case("not json")]
    #[case(r#"{ "event_capacity": 0 }"#)]
    #[case(r#"{ "unknown_field": 1 }"#)]
    fn test_from_json_rejects(#[case] json: &str) {
        let err = PlatformConfig::from_json(json).unwrap_err();
        assert!(err.is(ErrorKind::InvalidParameter));
    }
}
