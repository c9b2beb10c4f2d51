//! Sharded topic registry.
//!
//! Maps topic names to the set of live subscriber sessions. Topics are
//! sharded by hash, each shard behind its own lock, so publishes to
//! unrelated topics never contend. A separate session index (session id ->
//! subscribed topics) makes `drop_session` proportional to the topics the
//! session actually held; publishes never touch it.
//!
//! A topic exists in a shard only while at least one session is subscribed
//! to it; the last unsubscribe prunes the entry.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::models::{ActivityEvent, Topic};
use crate::Result;

use super::queue::OutboundFrame;
use super::session::{ConnectionSession, SessionId};

const SHARD_COUNT: usize = 16;

type Shard = HashMap<Topic, HashMap<SessionId, Arc<ConnectionSession>>>;

/// Server-side mapping from topic to live subscriber sessions.
#[derive(Debug)]
pub struct TopicRegistry {
    shards: Vec<Mutex<Shard>>,
    /// Session id -> topics it holds. Guarded separately from the shards;
    /// lock order is always sessions before shard.
    sessions: Mutex<HashMap<SessionId, HashSet<Topic>>>,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn shard_for(&self, topic: &Topic) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        topic.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe a session to a topic. Idempotent: subscribing twice from
    /// the same session is a no-op.
    pub fn subscribe(&self, session: &Arc<ConnectionSession>, topic: Topic) {
        let mut sessions = Self::lock(&self.sessions);
        let held = sessions.entry(session.id).or_default();
        if !held.insert(topic.clone()) {
            return;
        }
        let mut shard = Self::lock(self.shard_for(&topic));
        shard.entry(topic.clone()).or_default().insert(session.id, session.clone());
        debug!(session = %session.id, topic = %topic, "subscribed");
    }

    /// Remove a session from a topic, pruning the topic when it empties.
    pub fn unsubscribe(&self, session_id: SessionId, topic: &Topic) {
        let mut sessions = Self::lock(&self.sessions);
        let Some(held) = sessions.get_mut(&session_id) else {
            return;
        };
        if !held.remove(topic) {
            return;
        }
        self.remove_from_shard(session_id, topic);
        debug!(session = %session_id, topic = %topic, "unsubscribed");
    }

    fn remove_from_shard(&self, session_id: SessionId, topic: &Topic) {
        let mut shard = Self::lock(self.shard_for(topic));
        if let Some(subscribers) = shard.get_mut(topic) {
            subscribers.remove(&session_id);
            if subscribers.is_empty() {
                shard.remove(topic);
            }
        }
    }

    /// Publish an event to one topic.
    ///
    /// Serializes the envelope once and enqueues it on every subscriber's
    /// bounded queue; never blocks on a slow consumer. Returns the number of
    /// sessions the event was handed to.
    pub fn publish(&self, topic: &Topic, event: &ActivityEvent) -> Result<usize> {
        let payload: Arc<str> = Arc::from(serde_json::to_string(event)?);
        Ok(self.publish_payload(topic, payload, false))
    }

    /// Enqueue an already-serialized frame on every subscriber of a topic.
    pub fn publish_payload(&self, topic: &Topic, payload: Arc<str>, critical: bool) -> usize {
        let shard = Self::lock(self.shard_for(topic));
        let Some(subscribers) = shard.get(topic) else {
            return 0;
        };
        let mut delivered = 0;
        for session in subscribers.values() {
            let frame = OutboundFrame { payload: payload.clone(), critical };
            if session.queue().push(frame) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Remove a session from every topic it held and prune empty topics.
    ///
    /// Safe to call concurrently with an in-flight publish to the same
    /// session: enqueues race only against the queue's own close, which is
    /// linearized under the queue lock.
    pub fn drop_session(&self, session_id: SessionId) {
        let mut sessions = Self::lock(&self.sessions);
        let Some(held) = sessions.remove(&session_id) else {
            return;
        };
        for topic in &held {
            self.remove_from_shard(session_id, topic);
        }
        debug!(session = %session_id, topics = held.len(), "session dropped");
    }

    /// Number of topics currently registered (test/diagnostic helper).
    pub fn topic_count(&self) -> usize {
        self.shards.iter().map(|s| Self::lock(s).len()).sum()
    }

    /// Number of subscribers on one topic.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        Self::lock(self.shard_for(topic))
            .get(topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Actor, EventKind};
    use chrono::Utc;

    fn session() -> Arc<ConnectionSession> {
        let s = Arc::new(ConnectionSession::new("u-1", 16));
        s.activate();
        s
    }

    fn event(id: &str, project: Option<&str>) -> ActivityEvent {
        ActivityEvent {
            id: id.to_string(),
            kind: EventKind::TaskCompleted,
            description: "done".to_string(),
            occurred_at: Utc::now(),
            actor: Actor {
                id: "u-1".to_string(),
                display_name: "U One".to_string(),
                initials: "UO".to_string(),
                avatar_ref: None,
            },
            project: project.map(String::from),
            task: None,
        }
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let registry = TopicRegistry::new();
        let s = session();
        registry.subscribe(&s, Topic::Global);
        registry.subscribe(&s, Topic::Global);
        assert_eq!(registry.subscriber_count(&Topic::Global), 1);
        assert_eq!(registry.topic_count(), 1);
    }

    #[test]
    fn test_publish_reaches_only_subscribers() {
        let registry = TopicRegistry::new();
        let a = session();
        let b = session();
        registry.subscribe(&a, Topic::Global);
        registry.subscribe(&b, Topic::project("42"));

        let delivered = registry.publish(&Topic::Global, &event("e-1", None)).unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(a.queue().len(), 1);
        assert_eq!(b.queue().len(), 0);
    }

    #[test]
    fn test_publish_to_empty_topic_delivers_nothing() {
        let registry = TopicRegistry::new();
        let delivered = registry.publish(&Topic::project("7"), &event("e-1", Some("7"))).unwrap();
        assert_eq!(delivered, 0);
    }

    #[test]
    fn test_unsubscribe_prunes_empty_topic() {
        let registry = TopicRegistry::new();
        let s = session();
        registry.subscribe(&s, Topic::project("42"));
        assert_eq!(registry.topic_count(), 1);

        registry.unsubscribe(s.id, &Topic::project("42"));
        assert_eq!(registry.topic_count(), 0);
        assert_eq!(registry.subscriber_count(&Topic::project("42")), 0);
    }

    #[test]
    fn test_drop_session_removes_every_subscription() {
        let registry = TopicRegistry::new();
        let s = session();
        let other = session();
        registry.subscribe(&s, Topic::Global);
        registry.subscribe(&s, Topic::project("42"));
        registry.subscribe(&other, Topic::Global);

        registry.drop_session(s.id);

        // global survives through the other session; project:42 pruned
        assert_eq!(registry.subscriber_count(&Topic::Global), 1);
        assert_eq!(registry.topic_count(), 1);

        // Dropping again is a no-op
        registry.drop_session(s.id);
        assert_eq!(registry.topic_count(), 1);
    }

    #[test]
    fn test_publish_skips_closed_session_queue() {
        let registry = TopicRegistry::new();
        let s = session();
        registry.subscribe(&s, Topic::Global);
        s.begin_close();

        let delivered = registry.publish(&Topic::Global, &event("e-1", None)).unwrap();
        assert_eq!(delivered, 0);
    }
}
