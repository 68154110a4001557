//! Session configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default cap on bytes buffered for one inbound stream (8 MiB).
pub const MAX_OUTSTANDING_BYTES: usize = 8 * 1024 * 1024;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Tunables for one session. Durations are expressed in milliseconds when
/// serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Largest payload of a single data frame. `None` sends each read as one
    /// frame.
    pub max_frame_payload: Option<usize>,
    /// Size of each read from a byte source.
    pub read_buffer_size: usize,
    /// Depth of the queue between producers and the frame serializer.
    pub outbound_queue_depth: usize,
    /// Hard cap on bytes buffered for one inbound stream; data beyond it is
    /// dropped.
    pub max_outstanding_bytes: usize,
    /// Inbound backlog at which the peer is paused.
    pub inbound_high_water: usize,
    /// Inbound backlog at which the peer is resumed.
    pub inbound_low_water: usize,
    /// Malformed frames tolerated before the session errors.
    pub malformed_frame_limit: u32,
    /// How long to keep forwarding output after the process exits.
    #[serde(with = "millis")]
    pub drain_timeout: Duration,
    /// Deadline for each transport write.
    #[serde(with = "millis")]
    pub write_timeout: Duration,
    /// Fail the session when nothing is received for this long.
    #[serde(with = "opt_millis")]
    pub idle_timeout: Option<Duration>,
    /// Kill the process when the session ends before it exits.
    pub kill_on_close: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: None,
            read_buffer_size: 32 * 1024,
            outbound_queue_depth: 64,
            max_outstanding_bytes: MAX_OUTSTANDING_BYTES,
            inbound_high_water: 1024 * 1024,
            inbound_low_water: 256 * 1024,
            malformed_frame_limit: 3,
            drain_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(30),
            idle_timeout: None,
            kill_on_close: true,
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON document. Missing fields take defaults.
    ///
    /// # Errors
    /// Returns error if the JSON is invalid or fails validation.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed or validated.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    /// Returns error describing the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_payload == Some(0) {
            return Err(ConfigError::Invalid("max_frame_payload must be positive".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("read_buffer_size must be positive".into()));
        }
        if self.outbound_queue_depth == 0 {
            return Err(ConfigError::Invalid("outbound_queue_depth must be positive".into()));
        }
        if self.inbound_low_water >= self.inbound_high_water {
            return Err(ConfigError::Invalid(
                "inbound_low_water must be below inbound_high_water".into(),
            ));
        }
        if self.inbound_high_water > self.max_outstanding_bytes {
            return Err(ConfigError::Invalid(
                "inbound_high_water must not exceed max_outstanding_bytes".into(),
            ));
        }
        if self.malformed_frame_limit == 0 {
            return Err(ConfigError::Invalid("malformed_frame_limit must be positive".into()));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        SessionConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config =
            SessionConfig::from_json(r#"{"max_frame_payload": 1024, "idle_timeout": 45000}"#)
                .unwrap();
        assert_eq!(config.max_frame_payload, Some(1024));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(45)));
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
        assert_eq!(config.max_outstanding_bytes, MAX_OUTSTANDING_BYTES);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = SessionConfig {
            idle_timeout: Some(Duration::from_millis(1500)),
            ..SessionConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"drain_timeout\":5000"));
        assert_eq!(SessionConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_rejects_inverted_watermarks() {
        let err = SessionConfig::from_json(
            r#"{"inbound_high_water": 100, "inbound_low_water": 200}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_frame_payload() {
        assert!(SessionConfig::from_json(r#"{"max_frame_payload": 0}"#).is_err());
    }
}
