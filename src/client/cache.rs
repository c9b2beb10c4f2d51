//! Persisted local activity cache.
//!
//! A bounded, TTL-bound per-topic buffer of recently seen events, shared by
//! every tab of one browser profile. A freshly opened view replays this
//! buffer instantly instead of waiting for the live connection.
//!
//! Layout on disk: one JSON file per profile mapping topic ->
//! `{events[], lastUpdated}`, at
//! `<data-dir>/pulsefeed/<profile-hash>/activity-cache.json`. The directory
//! is overridable through `PULSEFEED_DATA_DIR` or an injected path, which is
//! what the tests use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::CacheConfig;
use crate::models::{ActivityEvent, Topic};
use crate::{Error, Result};

/// One topic's cached events, newest first, plus its last-write stamp.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopicBuffer {
    events: Vec<ActivityEvent>,
    last_updated: DateTime<Utc>,
}

/// Bounded per-topic persisted event buffer.
#[derive(Debug)]
pub struct LocalActivityCache {
    path: PathBuf,
    config: CacheConfig,
    buffers: Mutex<HashMap<String, TopicBuffer>>,
}

impl LocalActivityCache {
    /// Open the cache for a profile at the default (or env-overridden)
    /// location.
    pub fn open(profile: &str, config: CacheConfig) -> Result<Self> {
        let dir = data_dir()?.join(profile_hash(profile));
        std::fs::create_dir_all(&dir)?;
        Self::open_at(dir.join("activity-cache.json"), config)
    }

    /// Open the cache at an explicit file path (dependency injection for
    /// tests).
    pub fn open_at(path: PathBuf, config: CacheConfig) -> Result<Self> {
        let buffers = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            config,
            buffers: Mutex::new(buffers),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TopicBuffer>> {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached events for a topic, oldest first (replay order).
    pub fn get(&self, topic: &Topic) -> Vec<ActivityEvent> {
        let buffers = self.lock();
        match buffers.get(&topic.to_string()) {
            Some(buffer) => buffer.events.iter().rev().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Append an event to a topic's buffer.
    ///
    /// De-duplicates by event id, prepends (newest first), truncates to the
    /// configured bound, and persists. Appending an already-cached id leaves
    /// the buffer untouched.
    pub fn append(&self, topic: &Topic, event: &ActivityEvent) -> Result<()> {
        let mut buffers = self.lock();
        let buffer = buffers.entry(topic.to_string()).or_default();
        if buffer.events.iter().any(|e| e.id == event.id) {
            return Ok(());
        }
        buffer.events.insert(0, event.clone());
        buffer.events.truncate(self.config.max_entries);
        buffer.last_updated = Utc::now();
        self.persist(&buffers)
    }

    /// Drop one topic's buffer.
    pub fn clear(&self, topic: &Topic) -> Result<()> {
        let mut buffers = self.lock();
        if buffers.remove(&topic.to_string()).is_some() {
            self.persist(&buffers)?;
        }
        Ok(())
    }

    /// Drop buffers whose last write is older than the TTL. Returns how many
    /// topics were removed. Runs on the hourly sweep timer so the cache does
    /// not grow without bound across many visited projects.
    pub fn sweep(&self) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::hours(self.config.ttl_hours as i64);
        let mut buffers = self.lock();
        let before = buffers.len();
        buffers.retain(|_, buffer| buffer.last_updated >= cutoff);
        let removed = before - buffers.len();
        if removed > 0 {
            debug!(removed, "swept expired topic buffers");
            self.persist(&buffers)?;
        }
        Ok(removed)
    }

    /// Write-then-rename so a crash never leaves a truncated cache file.
    fn persist(&self, buffers: &HashMap<String, TopicBuffer>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(buffers)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Number of topics currently buffered.
    pub fn topic_count(&self) -> usize {
        self.lock().len()
    }
}

/// Base data directory: `PULSEFEED_DATA_DIR` override, else the platform
/// data dir.
fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("PULSEFEED_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    dirs::data_dir()
        .map(|d| d.join("pulsefeed"))
        .ok_or_else(|| Error::Other("could not determine data directory".to_string()))
}

/// Stable short hash scoping cache storage to one profile.
fn profile_hash(profile: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(profile.as_bytes());
    let hash_hex = format!("{:x}", hasher.finalize());
    hash_hex[..16].to_string()
}

/// Spawn the periodic sweep task for a shared cache.
pub fn spawn_sweeper(
    cache: std::sync::Arc<LocalActivityCache>,
    period: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await;
        loop {
            timer.tick().await;
            if let Err(e) = cache.sweep() {
                tracing::warn!(error = %e, "cache sweep failed");
            }
        }
    })
}
