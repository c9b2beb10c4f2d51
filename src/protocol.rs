//! Wire protocol types for activity distribution.
//!
//! This module defines the JSON frames exchanged between clients and the
//! activity server over WebSocket connections.
//!
//! # Protocol Overview
//!
//! The server exposes a WebSocket endpoint at `/ws`. Frames are JSON-encoded.
//!
//! ## Client -> Server Frames ([`ClientFrame`])
//! - control: `{"action": "subscribe", "topic": "project:42"}`
//! - control: `{"action": "unsubscribe", "topic": "global"}`
//! - heartbeat: `{"type": "HEARTBEAT", "timestamp": "..."}`
//!
//! ## Server -> Client Frames ([`ServerFrame`])
//! - event envelope: `{"id", "type", "description", "occurredAt", "actor",
//!   "project"?, "task"?}` (see [`ActivityEvent`])
//! - heartbeat: `{"type": "HEARTBEAT", "timestamp": "..."}`
//!
//! Control frames carry an `action` discriminator while heartbeats and event
//! envelopes are discriminated by their `type` field, so the frame enums are
//! resolved by shape rather than a single tag.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::models::{ActivityEvent, Topic};

/// Bidirectional liveness frame with no payload semantics beyond liveness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Heartbeat {
    /// Sender-side timestamp; informational only.
    pub timestamp: DateTime<Utc>,
}

impl Heartbeat {
    /// Heartbeat stamped with the current time.
    pub fn now() -> Self {
        Self { timestamp: Utc::now() }
    }
}

// Wire shape is {"type": "HEARTBEAT", "timestamp": ...}; serde derive cannot
// express a fixed-value tag field on a struct, so both impls are manual.
impl Serialize for Heartbeat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", "HEARTBEAT")?;
        map.serialize_entry("timestamp", &self.timestamp)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Heartbeat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(rename = "type")]
            kind: String,
            timestamp: DateTime<Utc>,
        }
        let raw = Raw::deserialize(deserializer)?;
        if raw.kind != "HEARTBEAT" {
            return Err(D::Error::custom("not a heartbeat frame"));
        }
        Ok(Heartbeat { timestamp: raw.timestamp })
    }
}

/// Subscription control verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Subscribe,
    Unsubscribe,
}

/// A subscription control message.
///
/// The server registers or removes the session in the topic registry; no
/// explicit ack frame is sent (absence of subsequent events is not an error
/// signal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: ControlAction,
    pub topic: Topic,
}

/// Frames sent from clients to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientFrame {
    Heartbeat(Heartbeat),
    Control(ControlMessage),
}

impl ClientFrame {
    /// Decode a client frame, mapping malformed input to a protocol error.
    pub fn decode(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text).map_err(|e| crate::Error::Protocol(e.to_string()))
    }

    /// Encode this frame as a JSON string.
    pub fn encode(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frames sent from the server to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Heartbeat(Heartbeat),
    Event(ActivityEvent),
}

impl ServerFrame {
    /// Decode a server frame, mapping malformed input to a protocol error.
    pub fn decode(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text).map_err(|e| crate::Error::Protocol(e.to_string()))
    }

    /// Encode this frame as a JSON string.
    pub fn encode(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
