//! Configuration for the activity distribution service.
//!
//! Configuration is a TOML file with three sections:
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8470
//! heartbeat-interval-secs = 30
//!
//! [client]
//! backoff-base-secs = 2
//! backoff-cap-secs = 30
//!
//! [cache]
//! max-entries = 100
//! ttl-hours = 24
//! ```
//!
//! Every field has a default, so a missing file or a partial file is valid.
//! Precedence: CLI flag > config file > default.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::Result;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub cache: CacheConfig,
    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when
    /// `path` is `None` or the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                Ok(toml::from_str(&raw)?)
            }
            _ => Ok(Self::default()),
        }
    }
}

/// Server-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port. Port 0 binds an ephemeral port (used by tests).
    pub port: u16,
    /// Expected client heartbeat interval. A session is considered dead when
    /// nothing arrives for 3x this interval.
    pub heartbeat_interval_secs: u64,
    /// Per-session outbound queue capacity. When full, the oldest buffered
    /// non-critical event is dropped.
    pub queue_capacity: usize,
    /// How long a closing session may take to drain its queue before the
    /// connection is torn down anyway.
    pub close_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8470,
            heartbeat_interval_secs: 30,
            queue_capacity: 256,
            close_grace_secs: 5,
        }
    }
}

impl ServerConfig {
    /// Heartbeat deadline: a session missing heartbeats for this long is
    /// transitioned to CLOSING.
    pub fn heartbeat_deadline(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs * 3)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_secs(self.close_grace_secs)
    }
}

/// Client-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClientConfig {
    /// First reconnect delay.
    pub backoff_base_secs: u64,
    /// Ceiling for the doubling reconnect delay.
    pub backoff_cap_secs: u64,
    /// Reconnect attempts before giving up and surfacing a manual retry.
    pub max_reconnect_attempts: u32,
    /// Heartbeat interval while any tab is visible.
    pub heartbeat_visible_secs: u64,
    /// Heartbeat interval while all tabs are hidden.
    pub heartbeat_hidden_secs: u64,
    /// A heartbeat is skipped if one was already sent within this window.
    pub heartbeat_coalesce_secs: u64,
    /// Connection is kept alive this long after the last tab unregisters.
    pub tab_grace_secs: u64,
    /// Bound on events queued while all tabs are hidden (oldest dropped).
    pub hidden_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backoff_base_secs: 2,
            backoff_cap_secs: 30,
            max_reconnect_attempts: 8,
            heartbeat_visible_secs: 30,
            heartbeat_hidden_secs: 60,
            heartbeat_coalesce_secs: 5,
            tab_grace_secs: 30,
            hidden_queue_capacity: 256,
        }
    }
}

/// Activity cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CacheConfig {
    /// Entries retained per topic buffer.
    pub max_entries: usize,
    /// A topic buffer idle longer than this is dropped at sweep time.
    pub ttl_hours: u64,
    /// Sweep timer period.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            ttl_hours: 24,
            sweep_interval_secs: 3600,
        }
    }
}

/// Static bearer tokens for the standalone binary.
///
/// Token validation is an external collaborator in the full deployment; the
/// standalone server accepts this token -> user-id map so it can run without
/// one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AuthConfig {
    pub tokens: HashMap<String, String>,
}
