//! Server side of the activity distribution layer.
//!
//! The service is explicitly constructed and dependency-injected: the
//! application root calls [`serve`] with its config and auth collaborator
//! and owns the returned [`ServerHandle`]. Tests construct a fresh instance
//! per case; there is no process-wide singleton.

pub mod auth;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod session;
pub mod ws;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::{Error, Result};

pub use auth::{Authenticator, StaticTokenAuthenticator};
pub use publisher::Publisher;
pub use registry::TopicRegistry;

/// Shared application state for the WebSocket endpoint.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TopicRegistry>,
    pub authenticator: Arc<dyn Authenticator>,
    pub config: ServerConfig,
}

/// A running activity server.
///
/// Dropping the handle does not stop the server; call [`ServerHandle::shutdown`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    publisher: Arc<Publisher>,
    shutdown_tx: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// The address the server actually bound (relevant with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL for clients of this server.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    /// The publisher domain code hands events to.
    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    /// Gracefully stop accepting connections and wait for the server task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

/// Bind and start the activity server.
pub async fn serve(config: ServerConfig, authenticator: Arc<dyn Authenticator>) -> Result<ServerHandle> {
    let registry = Arc::new(TopicRegistry::new());
    let publisher = Arc::new(Publisher::new(registry.clone()));

    let state = AppState {
        registry,
        authenticator,
        config: config.clone(),
    };

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|e| Error::Other(format!("Invalid host address '{}': {}", config.host, e)))?;
    let listener = tokio::net::TcpListener::bind(SocketAddr::from((host, config.port))).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "activity server listening");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    Ok(ServerHandle {
        local_addr,
        publisher,
        shutdown_tx,
        task,
    })
}
