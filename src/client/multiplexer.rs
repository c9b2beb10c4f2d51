//! Reference-counted subscription multiplexer.
//!
//! Maps logical subscriptions (global feed, per-project feed) to callbacks.
//! The first subscriber to a topic triggers a transport-level subscribe; the
//! nth only adds a local callback; the last unsubscribe tears the transport
//! subscription down. New subscribers are replayed the cached history for
//! their topic (oldest to newest) before any live event reaches them.
//!
//! Callbacks are invoked while the registry lock is held so the
//! replay-then-live ordering cannot be violated by a concurrent dispatch;
//! callbacks must not call back into the multiplexer.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::models::{ActivityEvent, Topic};

use super::cache::LocalActivityCache;

/// Transport-level subscription control, wired to the connection manager.
///
/// Implementations must not block and must not re-enter the multiplexer.
pub trait ControlTransport: Send + Sync {
    fn subscribe(&self, topic: &Topic);
    fn unsubscribe(&self, topic: &Topic);
}

type EventCallback = Box<dyn Fn(&ActivityEvent) + Send + Sync>;

struct TopicSubscription {
    /// Registered callbacks in registration order.
    callbacks: Vec<(u64, EventCallback)>,
    /// Event ids already delivered to this topic in the current session.
    seen: HashSet<String>,
}

struct MuxInner {
    topics: HashMap<Topic, TopicSubscription>,
    next_callback_id: u64,
}

/// Browser-side registry mapping topics to callbacks, with reference
/// counting.
pub struct SubscriptionMultiplexer {
    inner: Mutex<MuxInner>,
    transport: Arc<dyn ControlTransport>,
    cache: Arc<LocalActivityCache>,
}

impl SubscriptionMultiplexer {
    pub fn new(transport: Arc<dyn ControlTransport>, cache: Arc<LocalActivityCache>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MuxInner {
                topics: HashMap::new(),
                next_callback_id: 0,
            }),
            transport,
            cache,
        })
    }

    fn lock(&self) -> MutexGuard<'_, MuxInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a callback for a topic. Returns the disposer handle.
    ///
    /// The callback first receives the cached history for the topic, oldest
    /// to newest, then live events as they arrive.
    pub fn subscribe(
        self: &Arc<Self>,
        topic: Topic,
        callback: impl Fn(&ActivityEvent) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let (id, first) = {
            let mut inner = self.lock();
            // The history snapshot is taken under the registry lock: an
            // event appended and dispatched between the snapshot and the
            // callback registration would otherwise reach this subscriber
            // through neither replay nor live delivery.
            let replay = self.cache.get(&topic);
            let id = inner.next_callback_id;
            inner.next_callback_id += 1;

            let first = !inner.topics.contains_key(&topic);
            let entry = inner.topics.entry(topic.clone()).or_insert_with(|| TopicSubscription {
                callbacks: Vec::new(),
                seen: HashSet::new(),
            });
            // Replay before the callback is registered for live dispatch, so
            // a concurrent dispatch cannot interleave ahead of history.
            for event in &replay {
                callback(event);
                entry.seen.insert(event.id.clone());
            }
            entry.callbacks.push((id, Box::new(callback)));
            (id, first)
        };
        if first {
            debug!(topic = %topic, "first subscriber; opening transport subscription");
            self.transport.subscribe(&topic);
        }
        SubscriptionHandle {
            mux: self.clone(),
            topic,
            id,
            active: true,
        }
    }

    fn unsubscribe_callback(&self, topic: &Topic, id: u64) {
        let last = {
            let mut inner = self.lock();
            let Some(entry) = inner.topics.get_mut(topic) else {
                return;
            };
            entry.callbacks.retain(|(cb_id, _)| *cb_id != id);
            if entry.callbacks.is_empty() {
                inner.topics.remove(topic);
                true
            } else {
                false
            }
        };
        if last {
            debug!(topic = %topic, "last subscriber gone; closing transport subscription");
            self.transport.unsubscribe(topic);
        }
    }

    /// Deliver a live event to every matching subscribed topic.
    ///
    /// An event id already delivered to a topic in this session is discarded
    /// before reaching that topic's callbacks. Returns the number of
    /// callback invocations.
    pub fn dispatch(&self, event: &ActivityEvent) -> usize {
        let mut inner = self.lock();
        let mut invoked = 0;
        for topic in event.topics() {
            let Some(entry) = inner.topics.get_mut(&topic) else {
                continue;
            };
            if !entry.seen.insert(event.id.clone()) {
                continue;
            }
            for (_, callback) in &entry.callbacks {
                callback(event);
                invoked += 1;
            }
        }
        invoked
    }

    /// Whether any callback currently holds the topic.
    pub fn is_subscribed(&self, topic: &Topic) -> bool {
        self.lock().topics.contains_key(topic)
    }

    /// Topics with a nonzero reference count, for reconnect recovery.
    pub fn active_topics(&self) -> Vec<Topic> {
        self.lock().topics.keys().cloned().collect()
    }

    /// Drop every subscription synchronously. No callback fires afterward.
    ///
    /// Used on logout/teardown, where the transport is going away anyway, so
    /// no transport-level unsubscribes are sent.
    pub fn reset(&self) {
        self.lock().topics.clear();
    }
}

/// Disposer for one registered callback.
///
/// Unsubscribes on drop; [`SubscriptionHandle::unsubscribe`] does it
/// explicitly.
pub struct SubscriptionHandle {
    mux: Arc<SubscriptionMultiplexer>,
    topic: Topic,
    id: u64,
    active: bool,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.active {
            self.active = false;
            self.mux.unsubscribe_callback(&self.topic, self.id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::models::{Actor, EventKind};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Transport double recording every control call.
    #[derive(Default)]
    struct MockTransport {
        calls: StdMutex<Vec<String>>,
    }

    impl MockTransport {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ControlTransport for MockTransport {
        fn subscribe(&self, topic: &Topic) {
            self.calls.lock().unwrap().push(format!("subscribe {}", topic));
        }

        fn unsubscribe(&self, topic: &Topic) {
            self.calls.lock().unwrap().push(format!("unsubscribe {}", topic));
        }
    }

    fn event(id: &str, project: Option<&str>, at: chrono::DateTime<Utc>) -> ActivityEvent {
        ActivityEvent {
            id: id.to_string(),
            kind: EventKind::TaskCompleted,
            description: format!("event {}", id),
            occurred_at: at,
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

    fn setup(dir: &TempDir) -> (Arc<MockTransport>, Arc<LocalActivityCache>) {
        let transport = Arc::new(MockTransport::default());
        let cache = Arc::new(
            LocalActivityCache::open_at(
                dir.path().join("activity-cache.json"),
                CacheConfig::default(),
            )
            .unwrap(),
        );
        (transport, cache)
    }

    /// Collects delivered event ids for assertion.
    fn recorder() -> (Arc<StdMutex<Vec<String>>>, impl Fn(&ActivityEvent) + Send + Sync) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |e: &ActivityEvent| sink.lock().unwrap().push(e.id.clone()))
    }

    #[test]
    fn test_refcount_one_transport_subscription() {
        let dir = TempDir::new().unwrap();
        let (transport, cache) = setup(&dir);
        let mux = SubscriptionMultiplexer::new(transport.clone(), cache);

        let h1 = mux.subscribe(Topic::Global, |_| {});
        let h2 = mux.subscribe(Topic::Global, |_| {});
        let h3 = mux.subscribe(Topic::Global, |_| {});
        assert_eq!(transport.calls(), ["subscribe global"]);

        h1.unsubscribe();
        h2.unsubscribe();
        assert_eq!(transport.calls(), ["subscribe global"]);
        h3.unsubscribe();
        assert_eq!(transport.calls(), ["subscribe global", "unsubscribe global"]);
        assert!(!mux.is_subscribed(&Topic::Global));
    }

    #[test]
    fn test_replay_then_live_ordering() {
        let dir = TempDir::new().unwrap();
        let (transport, cache) = setup(&dir);
        let t0 = Utc::now();
        cache.append(&Topic::Global, &event("e-1", None, t0)).unwrap();
        cache
            .append(&Topic::Global, &event("e-2", None, t0 + ChronoDuration::seconds(1)))
            .unwrap();

        let mux = SubscriptionMultiplexer::new(transport, cache);
        let (seen, callback) = recorder();
        let _h = mux.subscribe(Topic::Global, callback);

        // Cached history arrives first, ascending in time.
        assert_eq!(*seen.lock().unwrap(), ["e-1", "e-2"]);

        mux.dispatch(&event("e-3", None, t0 + ChronoDuration::seconds(2)));
        assert_eq!(*seen.lock().unwrap(), ["e-1", "e-2", "e-3"]);
    }

    #[test]
    fn test_dispatch_dedups_by_event_id() {
        let dir = TempDir::new().unwrap();
        let (transport, cache) = setup(&dir);
        let mux = SubscriptionMultiplexer::new(transport, cache);
        let (seen, callback) = recorder();
        let _h = mux.subscribe(Topic::Global, callback);

        let e = event("e-1", None, Utc::now());
        assert_eq!(mux.dispatch(&e), 1);
        assert_eq!(mux.dispatch(&e), 0);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_replayed_event_not_delivered_again_live() {
        let dir = TempDir::new().unwrap();
        let (transport, cache) = setup(&dir);
        let e = event("e-1", None, Utc::now());
        cache.append(&Topic::Global, &e).unwrap();

        let mux = SubscriptionMultiplexer::new(transport, cache);
        let (seen, callback) = recorder();
        let _h = mux.subscribe(Topic::Global, callback);

        // The same event arriving live after replay is a duplicate.
        mux.dispatch(&e);
        assert_eq!(*seen.lock().unwrap(), ["e-1"]);
    }

    #[test]
    fn test_dual_topic_event_reaches_both_feeds_once() {
        let dir = TempDir::new().unwrap();
        let (transport, cache) = setup(&dir);
        let mux = SubscriptionMultiplexer::new(transport, cache);
        let (global_seen, global_cb) = recorder();
        let (project_seen, project_cb) = recorder();
        let _hg = mux.subscribe(Topic::Global, global_cb);
        let _hp = mux.subscribe(Topic::project("42"), project_cb);

        // The server emits one frame per topic match; both deliveries carry
        // the same event id, so the second frame is fully de-duplicated.
        let e = event("e-1", Some("42"), Utc::now());
        mux.dispatch(&e);
        mux.dispatch(&e);

        assert_eq!(*global_seen.lock().unwrap(), ["e-1"]);
        assert_eq!(*project_seen.lock().unwrap(), ["e-1"]);
    }

    #[test]
    fn test_subscribe_during_delivery_misses_nothing() {
        let dir = TempDir::new().unwrap();
        let (transport, cache) = setup(&dir);
        let mux = SubscriptionMultiplexer::new(transport, cache.clone());

        // Mirrors the connection manager's delivery path: append to the
        // cache, then dispatch, without holding the registry lock between
        // the two.
        let t0 = Utc::now();
        let publisher = {
            let cache = cache.clone();
            let mux = mux.clone();
            std::thread::spawn(move || {
                for i in 0..80 {
                    let e = event(&format!("e-{:03}", i), None, t0 + ChronoDuration::milliseconds(i));
                    cache.append(&Topic::Global, &e).unwrap();
                    mux.dispatch(&e);
                }
            })
        };

        // Subscribe mid-stream. Every event lands in the cache before it is
        // dispatched, so each one must reach the callback exactly once:
        // through replay if it preceded the subscription, live otherwise.
        std::thread::sleep(std::time::Duration::from_millis(1));
        let (seen, callback) = recorder();
        let _h = mux.subscribe(Topic::Global, callback);
        publisher.join().unwrap();

        let mut ids = seen.lock().unwrap().clone();
        let delivered = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), delivered, "an event was delivered twice");
        assert_eq!(ids.len(), 80, "an event reached neither replay nor live dispatch");
    }

    #[test]
    fn test_active_topics_tracks_nonzero_refcounts() {
        let dir = TempDir::new().unwrap();
        let (transport, cache) = setup(&dir);
        let mux = SubscriptionMultiplexer::new(transport, cache);
        let _hg = mux.subscribe(Topic::Global, |_| {});
        let hp = mux.subscribe(Topic::project("42"), |_| {});

        let mut topics = mux.active_topics();
        topics.sort_by_key(|t| t.to_string());
        assert_eq!(topics, vec![Topic::Global, Topic::project("42")]);

        hp.unsubscribe();
        assert_eq!(mux.active_topics(), vec![Topic::Global]);
    }

    #[test]
    fn test_reset_is_synchronous_and_silences_callbacks() {
        let dir = TempDir::new().unwrap();
        let (transport, cache) = setup(&dir);
        let mux = SubscriptionMultiplexer::new(transport.clone(), cache);
        let (seen, callback) = recorder();
        let handle = mux.subscribe(Topic::Global, callback);

        mux.reset();
        assert_eq!(mux.dispatch(&event("e-1", None, Utc::now())), 0);
        assert!(seen.lock().unwrap().is_empty());

        // Dropping a stale handle after teardown is a no-op.
        drop(handle);
        assert_eq!(transport.calls(), ["subscribe global"]);
    }
}
