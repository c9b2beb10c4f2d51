//! Idempotent event publisher.
//!
//! The seam between domain logic and the distribution layer: domain code
//! calls [`Publisher::publish`] and moves on. The call resolves the event's
//! topics exactly once, serializes the envelope exactly once, and fans the
//! shared payload out through the topic registry. Delivery is fire-and-forget
//! and at-least-once per session; the publisher itself never publishes the
//! same event id twice for the same topic.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::models::{ActivityEvent, Topic};
use crate::Result;

use super::registry::TopicRegistry;

/// How many (event id, topic) pairs the producer-side de-dup remembers.
/// Client-side id de-duplication is the final guard past this horizon.
const RECENT_INDEX_CAPACITY: usize = 1024;

/// Bounded insertion-ordered set of recently published (event, topic) pairs.
#[derive(Debug)]
struct RecentIndex {
    seen: HashSet<(String, Topic)>,
    order: VecDeque<(String, Topic)>,
}

impl RecentIndex {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record a pair; returns `false` when it was already present.
    fn insert(&mut self, key: (String, Topic)) -> bool {
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > RECENT_INDEX_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// Accepts domain events and fans them out to matching topics.
#[derive(Debug)]
pub struct Publisher {
    registry: Arc<TopicRegistry>,
    recent: Mutex<RecentIndex>,
}

impl Publisher {
    pub fn new(registry: Arc<TopicRegistry>) -> Self {
        Self {
            registry,
            recent: Mutex::new(RecentIndex::new()),
        }
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    /// Publish an event to its topics (`global`, plus `project:<id>` when
    /// scoped). Synchronous, never waits for any client. Returns the total
    /// number of session enqueues for observability.
    pub fn publish(&self, event: &ActivityEvent) -> Result<usize> {
        let payload: Arc<str> = Arc::from(serde_json::to_string(event)?);
        let mut delivered = 0;
        for topic in event.topics() {
            let fresh = {
                let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
                recent.insert((event.id.clone(), topic.clone()))
            };
            if !fresh {
                trace!(event = %event.id, topic = %topic, "skipping re-publish");
                continue;
            }
            delivered += self.registry.publish_payload(&topic, payload.clone(), false);
        }
        debug!(event = %event.id, delivered, "published");
        Ok(delivered)
    }
}
