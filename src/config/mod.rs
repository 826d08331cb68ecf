//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables
//! - CLI arguments (for the `wamp` binary)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WampError};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Reconnect configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| WampError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| WampError::Config(format!("Failed to parse config: {e}")))
    }

    /// Default config file location (`<config dir>/wamp/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("wamp").join("config.toml"))
    }

    /// Load the default config file if present, then apply environment overrides
    pub fn load() -> Result<Self> {
        let base = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        Ok(base.with_env())
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Apply environment variable overrides
    pub fn with_env(mut self) -> Self {
        if let Ok(endpoint) = std::env::var("WAMP_ENDPOINT") {
            self.session.endpoint = endpoint;
        }
        if let Ok(realm) = std::env::var("WAMP_REALM") {
            self.session.realm = realm;
        }
        if let Ok(authid) = std::env::var("WAMP_AUTHID") {
            self.session.authid = Some(authid);
        }
        if let Ok(val) = std::env::var("WAMP_MAX_RETRIES") {
            if let Ok(val) = val.parse() {
                self.retry.max_retries = val;
            }
        }
        self
    }

    /// Check values that would make a session unusable
    pub fn validate(&self) -> Result<()> {
        if self.session.realm.is_empty() {
            return Err(WampError::Config("realm must not be empty".to_string()));
        }
        if !crate::protocol::is_valid_uri(&self.session.realm) {
            return Err(WampError::Config(format!(
                "invalid realm '{}'",
                self.session.realm
            )));
        }
        if self.retry.multiplier < 1.0 {
            return Err(WampError::Config(
                "retry multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(WampError::Config(
                "initial retry delay exceeds maximum delay".to_string(),
            ));
        }
        if self.transport.serializer != "json" {
            return Err(WampError::Config(format!(
                "unsupported serializer '{}'",
                self.transport.serializer
            )));
        }
        Ok(())
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Router endpoint (`host:port` for RawSocket)
    pub endpoint: String,

    /// Realm to join
    pub realm: String,

    /// Agent string sent in HELLO
    pub agent: String,

    /// Authentication id (overrides the auth provider's)
    pub authid: Option<String>,

    /// Keep retrying when the very first connection attempt fails
    pub retry_if_unreachable: bool,

    /// How long to wait for the router's GOODBYE reply
    pub goodbye_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:8080".to_string(),
            realm: "realm1".to_string(),
            agent: format!("wamp-core-{}", env!("CARGO_PKG_VERSION")),
            authid: None,
            retry_if_unreachable: false,
            goodbye_timeout_ms: 5000,
        }
    }
}

impl SessionConfig {
    /// Session config for `realm` at `endpoint`
    pub fn new(endpoint: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            realm: realm.into(),
            ..Self::default()
        }
    }

    /// GOODBYE reply timeout
    pub fn goodbye_timeout(&self) -> Duration {
        Duration::from_millis(self.goodbye_timeout_ms)
    }
}

/// Reconnect configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,

    /// Upper bound for any retry delay in milliseconds
    pub max_delay_ms: u64,

    /// Growth factor applied after each retry
    pub multiplier: f64,

    /// Retries before giving up (negative = unlimited)
    pub max_retries: i32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 3000,
            max_delay_ms: 60_000,
            multiplier: 1.5,
            max_retries: 15,
        }
    }
}

impl RetryConfig {
    /// Never retry
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Serializer name
    pub serializer: String,

    /// Largest message accepted from the router in bytes
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            serializer: "json".to_string(),
            max_message_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}
