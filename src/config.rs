//! Configuration system for the MQTT session client.
//!
//! Loaded from a TOML file with `[connection]`, `[session]`, and
//! `[[subscription]]` sections. Credentials are referenced by environment
//! variable name and resolved at connect time, never stored in the file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::session::dispatcher::is_valid_filter;
use crate::transport::QosLevel;

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub session: SessionConfig,
    /// Topic filters subscribed at startup.
    #[serde(default, rename = "subscription")]
    pub subscriptions: Vec<SubscriptionEntry>,
}

/// Broker endpoint parameters for one connection attempt.
///
/// Cloned into each (re)connect attempt and never mutated while the
/// attempt is in flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Broker hostname or IP address.
    pub host: String,
    /// Broker port (default: 1883).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Client identifier; an empty string means one is generated per attempt.
    #[serde(default)]
    pub client_id: String,
    /// Enable TLS for the connection.
    #[serde(default)]
    pub use_tls: bool,
    /// Environment variable containing the username.
    pub username_env: Option<String>,
    /// Environment variable containing the password.
    pub password_env: Option<String>,
    /// Keep-alive interval in seconds (default: 60).
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive_secs() -> u64 {
    60
}

impl ConnectionConfig {
    /// Resolve the username from the configured environment variable.
    pub fn username(&self) -> Option<String> {
        self.username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    /// Resolve the password from the configured environment variable.
    pub fn password(&self) -> Option<String> {
        self.password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }
}

/// Session behavior knobs: timeouts, queue bounds, reconnect policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Window for a connect attempt to produce an outcome, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Maximum depth of the outbound publish queue; beyond it the oldest
    /// unsent entry is evicted.
    pub max_queue_depth: usize,
    /// Capacity of the application event channel.
    pub event_capacity: usize,
    pub reconnect: ReconnectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            max_queue_depth: 128,
            event_capacity: 64,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Reconnection policy: bounded exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited).
    pub max_attempts: Option<u32>,
    /// Delay before the first reconnection attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on the backoff delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(8),
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for the given attempt (1-based): the base delay
    /// doubles each attempt until it reaches the cap.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX))
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Whether another attempt is allowed after `attempts` tries.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt <= max,
            None => true,
        }
    }
}

/// A topic filter subscribed at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionEntry {
    pub filter: String,
    #[serde(default)]
    pub qos: QosLevel,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "connection.host must not be empty".to_string(),
            ));
        }
        if self.connection.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "connection.port must be non-zero".to_string(),
            ));
        }
        if self.session.max_queue_depth == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.max_queue_depth must be greater than 0".to_string(),
            ));
        }
        if self.session.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        self.session.reconnect.validate()?;
        for entry in &self.subscriptions {
            if !is_valid_filter(&entry.filter) {
                return Err(ConfigError::InvalidConfig(format!(
                    "invalid topic filter: '{}'",
                    entry.filter
                )));
            }
        }
        Ok(())
    }
}

impl ReconnectConfig {
    /// Validate the backoff parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(max_attempts) = self.max_attempts {
            if max_attempts == 0 {
                return Err(ConfigError::InvalidConfig(
                    "reconnect.max_attempts must be greater than 0 or absent for unlimited"
                        .to_string(),
                ));
            }
        }
        if self.base_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.base_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_delay_ms must not be smaller than base_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}
