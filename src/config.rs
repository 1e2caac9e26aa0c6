//! Server Configuration
//!
//! Settings for the network manager and logging, loadable from TOML.
//! Every key has a default, so a config file only needs the values it
//! overrides.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LogLevel;
use crate::network::framing::DEFAULT_MAX_MESSAGE_SIZE;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("Invalid config value for {key}: {reason}")]
    Invalid {
        /// Offending key.
        key: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Lowest severity written.
    pub level: LogLevel,
    /// Log file; stdout when unset.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Notice,
            file: None,
        }
    }
}

/// Network manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listening address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent sessions.
    pub max_connections: usize,
    /// Upper bound on one readiness wait (milliseconds).
    pub poll_timeout_ms: u64,
    /// Largest payload accepted or sent.
    pub max_message_size: usize,
    /// Buffer size for each non-blocking read.
    pub read_chunk_size: usize,
    /// Unsent bytes tolerated per session before it is killed.
    pub max_send_backlog: usize,
    /// Inactivity limit in seconds; 0 disables.
    pub idle_timeout_secs: u64,
    /// Logging settings.
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7777)),
            max_connections: 1000,
            poll_timeout_ms: 50,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_chunk_size: 4096,
            max_send_backlog: 1024 * 1024,
            idle_timeout_secs: 0,
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse a TOML document.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Reject values the I/O loop cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool); 5] = [
            ("max_connections", self.max_connections == 0),
            ("poll_timeout_ms", self.poll_timeout_ms == 0),
            ("max_message_size", self.max_message_size == 0),
            ("read_chunk_size", self.read_chunk_size == 0),
            ("max_send_backlog", self.max_send_backlog == 0),
        ];
        if let Some(key) = checks.iter().find(|(_, bad)| *bad).map(|(key, _)| *key) {
            return Err(ConfigError::Invalid {
                key,
                reason: "must be greater than zero",
            });
        }
        if self.max_message_size > u32::MAX as usize {
            return Err(ConfigError::Invalid {
                key: "max_message_size",
                reason: "must fit the 32-bit length field",
            });
        }
        Ok(())
    }

    /// Readiness wait bound.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Inactivity limit, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}
