//! Tab coordination for one browser profile.
//!
//! Multiple open tabs share one underlying connection. The coordinator
//! tracks the set of registered tabs and their visibility, exposes a watch
//! channel telling the connection manager whether a connection is wanted,
//! and queues events while every tab is hidden so nothing is rendered into
//! an invisible document.
//!
//! Visibility is pushed in through explicit [`TabCoordinator::set_visible`]
//! notifications (the embedder wires these to native visibility-change
//! events); nothing here polls.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::models::ActivityEvent;

#[derive(Debug)]
struct TabState {
    /// Tab id -> currently visible.
    tabs: HashMap<String, bool>,
    /// Events held back while every tab is hidden, in arrival order.
    hidden_queue: VecDeque<ActivityEvent>,
    /// Bumped on every registration; outstanding grace timers from an older
    /// epoch are stale and must not flip the desire flag.
    epoch: u64,
    dropped: u64,
}

/// Tracks open tabs and decides when a connection is wanted.
#[derive(Debug)]
pub struct TabCoordinator {
    inner: Mutex<TabState>,
    desired_tx: watch::Sender<bool>,
    /// Connection survives this long after the last tab unregisters, so a
    /// tab refresh or navigation does not churn the connection.
    grace: Duration,
    queue_capacity: usize,
}

impl TabCoordinator {
    /// Create a coordinator plus the receiver side of its desire signal.
    pub fn new(grace: Duration, queue_capacity: usize) -> (Arc<Self>, watch::Receiver<bool>) {
        let (desired_tx, desired_rx) = watch::channel(false);
        let coordinator = Arc::new(Self {
            inner: Mutex::new(TabState {
                tabs: HashMap::new(),
                hidden_queue: VecDeque::new(),
                epoch: 0,
                dropped: 0,
            }),
            desired_tx,
            grace,
            queue_capacity,
        });
        (coordinator, desired_rx)
    }

    fn lock(&self) -> MutexGuard<'_, TabState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an open tab (initially visible). The returned guard
    /// unregisters on drop or on an explicit [`TabRegistration::unregister`].
    pub fn register_tab(self: &Arc<Self>, tab_id: impl Into<String>) -> TabRegistration {
        let tab_id = tab_id.into();
        {
            let mut state = self.lock();
            state.tabs.insert(tab_id.clone(), true);
            state.epoch += 1;
        }
        let _ = self.desired_tx.send(true);
        debug!(tab = %tab_id, "tab registered");
        TabRegistration {
            coordinator: self.clone(),
            tab_id,
            active: true,
        }
    }

    fn unregister(self: &Arc<Self>, tab_id: &str) {
        let epoch = {
            let mut state = self.lock();
            state.tabs.remove(tab_id);
            if !state.tabs.is_empty() {
                return;
            }
            state.epoch
        };
        debug!(tab = %tab_id, "last tab unregistered; grace window starts");
        // Keep the connection alive through the grace window, then re-check.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let coordinator = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(coordinator.grace).await;
                    let state = coordinator.lock();
                    if state.tabs.is_empty() && state.epoch == epoch {
                        drop(state);
                        let _ = coordinator.desired_tx.send(false);
                    }
                });
            }
            // No runtime (synchronous teardown): drop the desire immediately.
            Err(_) => {
                let _ = self.desired_tx.send(false);
            }
        }
    }

    /// Record a visibility change. Returns the queued events to flush, in
    /// arrival order, when this change makes the profile visible again.
    pub fn set_visible(&self, tab_id: &str, visible: bool) -> Vec<ActivityEvent> {
        let mut state = self.lock();
        let was_visible = state.tabs.values().any(|v| *v);
        if let Some(slot) = state.tabs.get_mut(tab_id) {
            *slot = visible;
        }
        let now_visible = state.tabs.values().any(|v| *v);
        if !was_visible && now_visible {
            return state.hidden_queue.drain(..).collect();
        }
        Vec::new()
    }

    /// Drain the hidden queue if some tab is visible. Used right after a
    /// registration so events queued during an all-hidden (or grace) window
    /// reach the newly opened tab.
    pub fn flush_if_visible(&self) -> Vec<ActivityEvent> {
        let mut state = self.lock();
        if state.tabs.values().any(|v| *v) && !state.hidden_queue.is_empty() {
            state.hidden_queue.drain(..).collect()
        } else {
            Vec::new()
        }
    }

    /// Whether any registered tab is currently visible.
    pub fn any_visible(&self) -> bool {
        self.lock().tabs.values().any(|v| *v)
    }

    /// Hold back an event while every tab is hidden. Bounded; the oldest
    /// queued event is dropped on overflow.
    pub fn queue_hidden(&self, event: ActivityEvent) {
        let mut state = self.lock();
        if state.hidden_queue.len() >= self.queue_capacity {
            state.hidden_queue.pop_front();
            state.dropped += 1;
        }
        state.hidden_queue.push_back(event);
    }

    pub fn tab_count(&self) -> usize {
        self.lock().tabs.len()
    }

    pub fn queued_count(&self) -> usize {
        self.lock().hidden_queue.len()
    }

    /// Events discarded by the hidden-queue overflow policy so far.
    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }
}

/// RAII registration for one open tab.
#[derive(Debug)]
pub struct TabRegistration {
    coordinator: Arc<TabCoordinator>,
    tab_id: String,
    active: bool,
}

impl TabRegistration {
    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    /// Explicitly unregister this tab.
    pub fn unregister(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.active {
            self.active = false;
            self.coordinator.unregister(&self.tab_id);
        }
    }
}

impl Drop for TabRegistration {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Actor, EventKind};
    use chrono::Utc;

    fn event(id: &str) -> ActivityEvent {
        ActivityEvent {
            id: id.to_string(),
            kind: EventKind::TaskUpdated,
            description: format!("event {}", id),
            occurred_at: Utc::now(),
            actor: Actor {
                id: "u-1".to_string(),
                display_name: "U One".to_string(),
                initials: "UO".to_string(),
                avatar_ref: None,
            },
            project: None,
            task: None,
        }
    }

    #[tokio::test]
    async fn test_register_wants_connection() {
        let (tabs, desired) = TabCoordinator::new(Duration::from_secs(30), 16);
        assert!(!*desired.borrow());
        let _reg = tabs.register_tab("tab-1");
        assert!(*desired.borrow());
    }

    #[tokio::test]
    async fn test_unregister_one_of_two_keeps_desire() {
        let (tabs, desired) = TabCoordinator::new(Duration::from_secs(30), 16);
        let reg_a = tabs.register_tab("tab-a");
        let _reg_b = tabs.register_tab("tab-b");
        reg_a.unregister();
        assert!(*desired.borrow());
        assert_eq!(tabs.tab_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_window_then_desire_drops() {
        let (tabs, desired) = TabCoordinator::new(Duration::from_secs(30), 16);
        let reg = tabs.register_tab("tab-1");
        reg.unregister();
        // Still desired inside the grace window.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(*desired.borrow());
        // Past the window the desire drops.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!*desired.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregister_during_grace_keeps_connection() {
        let (tabs, desired) = TabCoordinator::new(Duration::from_secs(30), 16);
        let reg = tabs.register_tab("tab-1");
        reg.unregister();
        tokio::time::sleep(Duration::from_secs(5)).await;

        // Tab refresh: a new tab appears before the window closes.
        let _reg2 = tabs.register_tab("tab-2");
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(*desired.borrow());
    }

    #[tokio::test]
    async fn test_hidden_queue_flushes_in_arrival_order() {
        let (tabs, _desired) = TabCoordinator::new(Duration::from_secs(30), 16);
        let _reg = tabs.register_tab("tab-1");
        tabs.set_visible("tab-1", false);
        assert!(!tabs.any_visible());

        tabs.queue_hidden(event("e-1"));
        tabs.queue_hidden(event("e-2"));
        tabs.queue_hidden(event("e-3"));

        let flushed = tabs.set_visible("tab-1", true);
        let ids: Vec<_> = flushed.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["e-1", "e-2", "e-3"]);
        assert_eq!(tabs.queued_count(), 0);
    }

    #[tokio::test]
    async fn test_hidden_queue_drops_oldest_on_overflow() {
        let (tabs, _desired) = TabCoordinator::new(Duration::from_secs(30), 2);
        let _reg = tabs.register_tab("tab-1");
        tabs.set_visible("tab-1", false);

        tabs.queue_hidden(event("e-1"));
        tabs.queue_hidden(event("e-2"));
        tabs.queue_hidden(event("e-3"));

        let flushed = tabs.set_visible("tab-1", true);
        let ids: Vec<_> = flushed.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["e-2", "e-3"]);
    }

    #[tokio::test]
    async fn test_still_visible_tab_means_no_queueing() {
        let (tabs, _desired) = TabCoordinator::new(Duration::from_secs(30), 16);
        let _reg_a = tabs.register_tab("tab-a");
        let _reg_b = tabs.register_tab("tab-b");
        tabs.set_visible("tab-a", false);
        // tab-b is still visible, so delivery does not pause.
        assert!(tabs.any_visible());
        // And hiding tab-a produced nothing to flush when it returns.
        assert!(tabs.set_visible("tab-a", true).is_empty());
    }
}
