//! Session configuration

use crate::ice::{IceConfiguration, IceServer};
use crate::media::MediaRetryConfig;
use crate::monitor::MonitorConfig;
use crate::reconnection::ReconnectionConfig;
use crate::track_manager::TrackManagerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Longest allowed statistics polling interval
pub const MAX_MONITORING_INTERVAL: Duration = Duration::from_secs(2);

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Document could not be parsed
    #[error("Invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid configuration value: {0}")]
    Invalid(String),
}

/// Configuration for one voice session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Configured ICE servers; STUN is always added
    pub ice_servers: Vec<IceServer>,
    /// Track operation queue
    pub track: TrackManagerConfig,
    /// Reconnection policy
    pub reconnection: ReconnectionConfig,
    /// Connection monitoring
    pub monitor: MonitorConfig,
    /// Local media acquisition retry
    pub media_retry: MediaRetryConfig,
    /// How long to wait for a stable negotiation state
    #[serde(with = "millis")]
    pub stable_wait_timeout: Duration,
    /// How long `join` waits for the peer roster
    #[serde(with = "millis")]
    pub roster_wait: Duration,
    /// Scheduled health-check cadence; `None` disables the loop
    #[serde(with = "opt_millis")]
    pub health_check_interval: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            track: TrackManagerConfig::default(),
            reconnection: ReconnectionConfig::default(),
            monitor: MonitorConfig::default(),
            media_retry: MediaRetryConfig::default(),
            stable_wait_timeout: Duration::from_secs(5),
            roster_wait: Duration::from_secs(2),
            health_check_interval: Some(Duration::from_secs(10)),
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON configuration document
    ///
    /// # Errors
    ///
    /// Returns error if the document is malformed or a value is out of range
    pub fn from_json(doc: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns error naming the first offending value
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.interval.is_zero() || self.monitor.interval > MAX_MONITORING_INTERVAL {
            return Err(ConfigError::Invalid(format!(
                "monitoring interval must be within (0, {:?}], got {:?}",
                MAX_MONITORING_INTERVAL, self.monitor.interval
            )));
        }
        if self.reconnection.backoff.is_empty() {
            return Err(ConfigError::Invalid(
                "reconnection backoff schedule cannot be empty".to_string(),
            ));
        }
        if self.reconnection.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconnection max_attempts must be at least 1".to_string(),
            ));
        }
        if self.track.operation_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "operation timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Validated ICE configuration
    #[must_use]
    pub fn ice_configuration(&self) -> IceConfiguration {
        IceConfiguration::from_servers(&self.ice_servers)
    }
}

/// Serialise a `Duration` as integer milliseconds
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Serialise an optional `Duration` as integer milliseconds
pub(crate) mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Serialise a list of `Duration`s as integer milliseconds
pub(crate) mod millis_vec {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &[Duration], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(
            d.iter()
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        )
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
        Ok(Vec::<u64>::deserialize(d)?
            .into_iter()
            .map(Duration::from_millis)
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.reconnection.max_attempts, 3);
        assert_eq!(
            config.reconnection.backoff,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert!(config.monitor.interval <= MAX_MONITORING_INTERVAL);
        assert_eq!(config.stable_wait_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_from_json_partial_document() {
        let config = SessionConfig::from_json(
            r#"{
                "ice_servers": [{"urls": ["turn:turn.example.org"], "username": "u", "credential": "p"}],
                "reconnection": {"max_attempts": 5, "backoff": [500, 1000], "signaling_wait": 3000},
                "health_check_interval": null
            }"#,
        )
        .unwrap();
        assert_eq!(config.reconnection.max_attempts, 5);
        assert_eq!(config.reconnection.backoff[0], Duration::from_millis(500));
        assert!(config.health_check_interval.is_none());
        assert!(config.ice_configuration().relay_available());
    }

    #[test]
    fn test_rejects_slow_monitoring() {
        let mut config = SessionConfig::default();
        config.monitor.interval = Duration::from_secs(5);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_empty_backoff() {
        let mut config = SessionConfig::default();
        config.reconnection.backoff.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
