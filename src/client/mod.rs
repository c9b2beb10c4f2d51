//! Browser-side activity client.
//!
//! [`ActivityClient`] wires the cache, tab coordinator, subscription
//! multiplexer, and connection manager together behind one handle. Construct
//! it with [`ActivityClient::connect`], spawn the returned
//! [`ClientConnectionManager`] with `tokio::spawn`, and drive everything else
//! through the client.

pub mod cache;
pub mod connection;
pub mod multiplexer;
pub mod tabs;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::{CacheConfig, ClientConfig};
use crate::models::{ActivityEvent, Topic};
use crate::Result;

pub use cache::LocalActivityCache;
pub use connection::{ClientConnectionManager, ConnectionState, ConnectionStatus};
pub use multiplexer::{SubscriptionHandle, SubscriptionMultiplexer};
pub use tabs::{TabCoordinator, TabRegistration};

use connection::ControlChannel;

/// One logical browser session against an activity server.
pub struct ActivityClient {
    mux: Arc<SubscriptionMultiplexer>,
    tabs: Arc<TabCoordinator>,
    cache: Arc<LocalActivityCache>,
    auth_tx: watch::Sender<Option<String>>,
    status: ConnectionStatus,
}

impl ActivityClient {
    /// Build a client for `url` (a `ws://.../ws` endpoint) with the cache
    /// keyed by `profile`. The returned manager must be spawned by the
    /// caller; the connection only opens once credentials are set and a tab
    /// is registered.
    pub fn connect(
        url: impl Into<String>,
        profile: &str,
        client_config: ClientConfig,
        cache_config: CacheConfig,
    ) -> Result<(Self, ClientConnectionManager)> {
        let cache = Arc::new(LocalActivityCache::open(profile, cache_config)?);
        Self::with_cache(url, client_config, cache)
    }

    /// Same as [`connect`](Self::connect) but with a caller-provided cache,
    /// for tests that point the cache at a temp directory.
    pub fn with_cache(
        url: impl Into<String>,
        client_config: ClientConfig,
        cache: Arc<LocalActivityCache>,
    ) -> Result<(Self, ClientConnectionManager)> {
        let (tabs, desired_rx) = TabCoordinator::new(
            Duration::from_secs(client_config.tab_grace_secs),
            client_config.hidden_queue_capacity,
        );
        let (control, control_rx) = ControlChannel::new();
        let mux = SubscriptionMultiplexer::new(Arc::new(control), cache.clone());
        let (auth_tx, auth_rx) = watch::channel(None);

        let manager = ClientConnectionManager::new(
            url.into(),
            client_config,
            mux.clone(),
            tabs.clone(),
            cache.clone(),
            auth_rx,
            desired_rx,
            control_rx,
        );
        let status = manager.status();

        Ok((
            Self {
                mux,
                tabs,
                cache,
                auth_tx,
                status,
            },
            manager,
        ))
    }

    /// Set (or rotate) the bearer token. The connection manager reacts to
    /// the change on its own.
    pub fn set_credentials(&self, token: impl Into<String>) {
        let _ = self.auth_tx.send(Some(token.into()));
    }

    /// Log out: tears the connection down and clears every in-memory
    /// subscription. Cached history stays on disk for the next login.
    pub fn logout(&self) {
        let _ = self.auth_tx.send(None);
        self.mux.reset();
    }

    /// Subscribe a callback to a topic. Cached history for the topic is
    /// replayed to the callback before any live event.
    pub fn subscribe(
        &self,
        topic: Topic,
        callback: impl Fn(&ActivityEvent) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.mux.subscribe(topic, callback)
    }

    /// Register a tab. The first registration asks the manager to connect;
    /// dropping the registration starts the grace window.
    pub fn register_tab(&self, tab_id: impl Into<String>) -> TabRegistration {
        let registration = self.tabs.register_tab(tab_id);
        // A tab appearing while others were hidden flushes anything queued.
        for event in self.tabs.flush_if_visible() {
            self.mux.dispatch(&event);
        }
        registration
    }

    /// Record a visibility change for a tab. Events queued while every tab
    /// was hidden are dispatched when one becomes visible again.
    pub fn set_tab_visible(&self, tab_id: &str, visible: bool) {
        for event in self.tabs.set_visible(tab_id, visible) {
            self.mux.dispatch(&event);
        }
    }

    /// Connection state observer, including the manual-retry hook for the
    /// exhausted-reconnects state.
    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn cache(&self) -> &Arc<LocalActivityCache> {
        &self.cache
    }

    /// Spawn the periodic cache TTL sweeper.
    pub fn spawn_cache_sweeper(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        cache::spawn_sweeper(self.cache.clone(), period)
    }
}
