//! Logging Setup
//!
//! Installs the global `tracing` subscriber. Severities follow the server's
//! four-level scheme, mapped onto `tracing` levels:
//!
//! | severity  | tracing  |
//! |-----------|----------|
//! | `debug`   | `DEBUG`  |
//! | `notice`  | `INFO`   |
//! | `warning` | `WARN`   |
//! | `error`   | `ERROR`  |
//!
//! `RUST_LOG` overrides the configured threshold when set.

use std::fs::OpenOptions;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Log severity, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal but noteworthy events.
    Notice,
    /// Recoverable problems.
    Warning,
    /// Failures.
    Error,
}

impl LogLevel {
    /// Equivalent `tracing` filter.
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Notice => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "notice" | "info" => Ok(LogLevel::Notice),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(LoggingError::UnknownLevel(other.to_string())),
        }
    }
}

/// Logging setup errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Unrecognized severity name.
    #[error("Unknown log level: {0}")]
    UnknownLevel(String),

    /// Log file could not be opened.
    #[error("Failed to open log file: {0}")]
    File(#[from] std::io::Error),

    /// A global subscriber is already installed.
    #[error("Logging already initialized")]
    AlreadyInitialized,
}

/// Install the global subscriber described by `config`.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = EnvFilter::builder()
        .with_default_directive(config.level.as_filter().into())
        .from_env_lossy();

    let writer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(config.file.is_none())
        .with_thread_names(true)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)
}
