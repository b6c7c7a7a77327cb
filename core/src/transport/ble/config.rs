//! BTP configuration
//!
//! Local maxima used during capability negotiation plus the five timer
//! durations. Values are loaded from JSON by embedders and validated before a
//! registry accepts them.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::codec::{MAX_WINDOW_SIZE, MIN_FRAGMENT_SIZE};

/// Largest fragment a characteristic can carry (251-byte LE data length minus L2CAP/ATT overhead)
pub const DEFAULT_MAX_FRAGMENT_SIZE: u16 = 244;

/// Default receive window, in fragments
pub const DEFAULT_MAX_WINDOW_SIZE: u8 = 6;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that can occur during config validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid fragment size: must be >= 6, got {0}")]
    InvalidFragmentSize(u16),

    #[error("Invalid window size: must be between 1 and 127, got {0}")]
    InvalidWindowSize(u8),

    #[error("Invalid max message size: must be > 0")]
    InvalidMessageSize,

    #[error("Invalid connection limit: must be > 0")]
    InvalidConnectionLimit,

    #[error("Invalid timeout: {0} must be > 0")]
    InvalidTimeout(&'static str),

    #[error("Send-ack timeout ({send_ack_ms} ms) must be shorter than ack timeout ({ack_ms} ms)")]
    AckTimeoutOrdering { send_ack_ms: u64, ack_ms: u64 },

    #[error("Invalid config document: {0}")]
    Parse(String),
}

// ============================================================================
// BTP CONFIG
// ============================================================================

/// Local BTP limits and timer durations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BtpConfig {
    /// Largest fragment this side will send; a responder never offers more
    pub max_fragment_size: u16,

    /// Largest window this side will grant or adopt
    pub max_window_size: u8,

    /// Largest message accepted for sending or reassembly
    pub max_message_size: u16,

    /// Connections the registry will hold at once
    pub max_connections: usize,

    pub connect_timeout_ms: u64,
    pub receive_connection_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub send_ack_timeout_ms: u64,
    pub unsubscribe_timeout_ms: u64,
}

impl Default for BtpConfig {
    fn default() -> Self {
        Self {
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            max_window_size: DEFAULT_MAX_WINDOW_SIZE,
            max_message_size: u16::MAX,
            max_connections: 4,
            connect_timeout_ms: 20_000,
            receive_connection_timeout_ms: 5_000,
            ack_timeout_ms: 15_000,
            send_ack_timeout_ms: 2_500,
            unsubscribe_timeout_ms: 5_000,
        }
    }
}

impl BtpConfig {
    /// Parse a JSON document and validate it. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_fragment_size(mut self, size: u16) -> Self {
        self.max_fragment_size = size;
        self
    }

    pub fn with_max_window_size(mut self, size: u8) -> Self {
        self.max_window_size = size;
        self
    }

    pub fn with_max_message_size(mut self, size: u16) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_max_connections(mut self, count: usize) -> Self {
        self.max_connections = count;
        self
    }

    pub fn with_ack_timeouts(mut self, ack_ms: u64, send_ack_ms: u64) -> Self {
        self.ack_timeout_ms = ack_ms;
        self.send_ack_timeout_ms = send_ack_ms;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_fragment_size < MIN_FRAGMENT_SIZE {
            return Err(ConfigError::InvalidFragmentSize(self.max_fragment_size));
        }
        if self.max_window_size == 0 || self.max_window_size > MAX_WINDOW_SIZE {
            return Err(ConfigError::InvalidWindowSize(self.max_window_size));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::InvalidMessageSize);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidConnectionLimit);
        }

        let timeouts = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("receive_connection_timeout_ms", self.receive_connection_timeout_ms),
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("send_ack_timeout_ms", self.send_ack_timeout_ms),
            ("unsubscribe_timeout_ms", self.unsubscribe_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::InvalidTimeout(*name));
        }

        if self.send_ack_timeout_ms >= self.ack_timeout_ms {
            return Err(ConfigError::AckTimeoutOrdering {
                send_ack_ms: self.send_ack_timeout_ms,
                ack_ms: self.ack_timeout_ms,
            });
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn receive_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_connection_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn send_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.send_ack_timeout_ms)
    }

    pub fn unsubscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.unsubscribe_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BtpConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_fragment_size, 244);
        assert_eq!(config.max_window_size, 6);
        assert_eq!(config.ack_timeout(), Duration::from_secs(15));
        assert_eq!(config.send_ack_timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn test_builder() {
        let config = BtpConfig::default()
            .with_max_fragment_size(64)
            .with_max_window_size(3)
            .with_max_message_size(1024)
            .with_max_connections(1);

        assert_eq!(config.max_fragment_size, 64);
        assert_eq!(config.max_window_size, 3);
        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.max_connections, 1);
    }

    #[test]
    fn test_validation_rejects_tiny_fragment() {
        let config = BtpConfig::default().with_max_fragment_size(5);
        assert_eq!(config.validate(), Err(ConfigError::InvalidFragmentSize(5)));
    }

    #[test]
    fn test_validation_rejects_zero_window() {
        let config = BtpConfig::default().with_max_window_size(0);
        assert_eq!(config.validate(), Err(ConfigError::InvalidWindowSize(0)));
    }

    #[test]
    fn test_validation_caps_window_inside_sequence_space() {
        let config = BtpConfig::default().with_max_window_size(MAX_WINDOW_SIZE);
        assert!(config.validate().is_ok());

        let config = BtpConfig::default().with_max_window_size(128);
        assert_eq!(config.validate(), Err(ConfigError::InvalidWindowSize(128)));
        let config = BtpConfig::default().with_max_window_size(255);
        assert_eq!(config.validate(), Err(ConfigError::InvalidWindowSize(255)));
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let mut config = BtpConfig::default();
        config.unsubscribe_timeout_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTimeout("unsubscribe_timeout_ms"))
        );
    }

    #[test]
    fn test_validation_rejects_send_ack_after_ack_timeout() {
        let config = BtpConfig::default().with_ack_timeouts(1_000, 1_000);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AckTimeoutOrdering { .. })
        ));
    }

    #[test]
    fn test_from_json_partial_document() {
        let config = BtpConfig::from_json(r#"{ "max_window_size": 4, "ack_timeout_ms": 9000 }"#)
            .expect("valid config");
        assert_eq!(config.max_window_size, 4);
        assert_eq!(config.ack_timeout_ms, 9000);
        assert_eq!(config.max_fragment_size, DEFAULT_MAX_FRAGMENT_SIZE);
    }

    #[test]
    fn test_from_json_rejects_invalid_values() {
        let result = BtpConfig::from_json(r#"{ "max_connections": 0 }"#);
        assert_eq!(result, Err(ConfigError::InvalidConnectionLimit));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let result = BtpConfig::from_json("not json");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = BtpConfig::default().with_max_window_size(2);
        let json = serde_json::to_string(&config).expect("serialize");
        let restored = BtpConfig::from_json(&json).expect("deserialize");
        assert_eq!(restored, config);
    }
}
