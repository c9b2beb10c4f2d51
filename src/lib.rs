//! Pulsefeed - real-time activity distribution for project workspaces.
//!
//! This library implements the publish/subscribe layer that pushes domain
//! events (task completed, member added, comment posted, ...) to every
//! interested, currently-connected client:
//!
//! - Server side: a sharded topic registry, per-session bounded outbound
//!   queues, and an idempotent publisher fanning events out over WebSocket.
//! - Client side: a reconnecting connection manager, a reference-counted
//!   subscription multiplexer, a tab coordinator, and a persisted per-topic
//!   activity cache for instant replay in freshly opened views.
//!
//! The CRUD surfaces of the surrounding application (persistence, auth
//! mechanics, bootstrap REST) are external collaborators and are not part of
//! this crate.

pub mod client;
pub mod config;
pub mod models;
pub mod protocol;
pub mod server;

/// Library-level error type for Pulsefeed operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Handshake rejected: invalid or expired credential")]
    AuthRejected,

    #[error("Reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Pulsefeed operations.
pub type Result<T> = std::result::Result<T, Error>;
