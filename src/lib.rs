//! # seeqd Network Manager
//!
//! Session-oriented TCP I/O for the seeqd game server: accepts connections,
//! frames and validates inbound byte streams, hands messages to the world
//! stage and delivers its replies.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SEEQD NETWORK MANAGER                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  network/        - I/O thread (single, cooperative)          │
//! │  ├── server.rs   - Readiness loop, NetHandle, spawn          │
//! │  ├── session.rs  - Session registry, deferred purge          │
//! │  ├── framing.rs  - Length + checksum envelope                │
//! │  ├── outbound.rs - World → I/O handoff queue                 │
//! │  └── world.rs    - I/O → world delivery interface            │
//! │                                                              │
//! │  config.rs       - TOML server configuration                 │
//! │  logging.rs      - tracing subscriber setup                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Threading
//!
//! Exactly one thread touches sockets. Every other thread talks to it
//! through a [`NetHandle`]: queue outbound messages, read session
//! snapshots, update session fields. Sessions are never removed while a
//! pass may still be looking at them; failures only mark a session dead,
//! and the loop purges dead sessions at the end of each pass.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod logging;
pub mod network;

// Re-export commonly used types
pub use config::{ConfigError, LoggingConfig, ServerConfig};
pub use logging::LogLevel;
pub use network::{
    spawn, NetHandle, NetworkError, NetworkManager, OutboundMessage, RunningServer, Session,
    SessionField, SessionId, Target, WorldEvent, WorldSink,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
