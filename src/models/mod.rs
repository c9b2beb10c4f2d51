//! Data models for activity distribution.
//!
//! This module defines the core data structures:
//! - `ActivityEvent` - An immutable domain event, produced once, never mutated
//! - `EventKind` - Closed enumeration of domain event categories
//! - `Actor` - Who caused an event
//! - `Topic` - A named routing key (`global` or `project:<id>`)

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Closed enumeration of domain event kinds.
///
/// Wire representation is SCREAMING_SNAKE_CASE under the `type` key of the
/// event envelope (e.g. `"TASK_COMPLETED"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    TaskCreated,
    TaskUpdated,
    TaskCompleted,
    TaskDeleted,
    ProjectCreated,
    ProjectUpdated,
    MemberAdded,
    MemberRemoved,
    CommentPosted,
    FileUploaded,
}

/// The user that caused an event.
///
/// `avatar_ref` is an opaque reference the UI resolves through an
/// authenticated fetch; events never embed signed URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    /// User id.
    pub id: String,
    /// Display name rendered in activity feeds.
    pub display_name: String,
    /// Short initials for avatar fallbacks.
    pub initials: String,
    /// Opaque avatar reference, if the user has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
}

/// An activity event as published to topics and delivered to clients.
///
/// Immutable once produced. `description` is pre-rendered at publish time so
/// delivery never needs domain lookups. The `id` is the primary
/// de-duplication key everywhere in the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    /// Globally unique identifier (UUID produced by domain code).
    pub id: String,

    /// Domain event kind.
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// Pre-rendered human-readable text.
    pub description: String,

    /// When the event occurred; used for ordering within a topic.
    pub occurred_at: DateTime<Utc>,

    /// Who caused the event.
    pub actor: Actor,

    /// Scoping reference used for `project:<id>` routing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    /// Task reference, when the event targets a task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

impl ActivityEvent {
    /// Resolve the topics this event routes to.
    ///
    /// Every event belongs to the `global` topic and to at most one
    /// `project:<id>` topic. Routing is derived exactly once at publish time
    /// and never re-evaluated.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics = vec![Topic::Global];
        if let Some(project) = &self.project {
            topics.push(Topic::Project(project.clone()));
        }
        topics
    }
}

/// A named routing key identifying a logical feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// The workspace-wide activity feed.
    Global,
    /// The per-project activity feed for the given project id.
    Project(String),
}

impl Topic {
    /// Construct a project topic from a project id.
    pub fn project(id: impl Into<String>) -> Self {
        Topic::Project(id.into())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Global => write!(f, "global"),
            Topic::Project(id) => write!(f, "project:{}", id),
        }
    }
}

impl FromStr for Topic {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "global" {
            return Ok(Topic::Global);
        }
        match s.split_once(':') {
            Some(("project", id)) if !id.is_empty() => Ok(Topic::Project(id.to_string())),
            _ => Err(crate::Error::InvalidTopic(s.to_string())),
        }
    }
}

// Topics travel on the wire as plain strings ("global", "project:42").
impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|_| D::Error::custom(format!("invalid topic: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_actor() -> Actor {
        Actor {
            id: "u-1".to_string(),
            display_name: "Dana Scully".to_string(),
            initials: "DS".to_string(),
            avatar_ref: None,
        }
    }

    fn sample_event(project: Option<&str>) -> ActivityEvent {
        ActivityEvent {
            id: "e-1234".to_string(),
            kind: EventKind::TaskCompleted,
            description: "Dana Scully completed \"Write report\"".to_string(),
            occurred_at: DateTime::parse_from_rfc3339("2026-02-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            actor: sample_actor(),
            project: project.map(String::from),
            task: Some("t-9".to_string()),
        }
    }

    #[test]
    fn test_topic_display_round_trip() {
        assert_eq!(Topic::Global.to_string(), "global");
        assert_eq!(Topic::project("42").to_string(), "project:42");
        assert_eq!("global".parse::<Topic>().unwrap(), Topic::Global);
        assert_eq!("project:42".parse::<Topic>().unwrap(), Topic::project("42"));
    }

    #[test]
    fn test_topic_parse_rejects_malformed() {
        assert!("project:".parse::<Topic>().is_err());
        assert!("projects:42".parse::<Topic>().is_err());
        assert!("".parse::<Topic>().is_err());
    }

    #[test]
    fn test_topic_serializes_as_string() {
        let json = serde_json::to_string(&Topic::project("42")).unwrap();
        assert_eq!(json, r#""project:42""#);
        let topic: Topic = serde_json::from_str(r#""global""#).unwrap();
        assert_eq!(topic, Topic::Global);
    }

    #[test]
    fn test_event_envelope_wire_format() {
        let event = sample_event(Some("42"));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"TASK_COMPLETED""#));
        assert!(json.contains(r#""occurredAt":"#));
        assert!(json.contains(r#""displayName":"Dana Scully""#));
        assert!(json.contains(r#""project":"42""#));
        // avatarRef is None and must be omitted, not null
        assert!(!json.contains("avatarRef"));

        let parsed: ActivityEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_event_topics_global_only() {
        let event = sample_event(None);
        assert_eq!(event.topics(), vec![Topic::Global]);
    }

    #[test]
    fn test_event_topics_global_and_project() {
        let event = sample_event(Some("42"));
        assert_eq!(event.topics(), vec![Topic::Global, Topic::project("42")]);
    }
}
