//! Client connection management.
//!
//! Owns the WebSocket transport, reconnection with exponential backoff,
//! heartbeats, and credential refresh. A connection is attempted only while
//! the user is authenticated AND at least one tab is registered; both
//! conditions are observed through watch channels and either becoming false
//! tears the connection down.
//!
//! On every successful connect the manager resubscribes each topic with a
//! nonzero reference count in the multiplexer, so application code never
//! re-calls subscribe across reconnects.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, http::StatusCode, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::models::{ActivityEvent, Topic};
use crate::protocol::{ClientFrame, ControlAction, ControlMessage, Heartbeat, ServerFrame};
use crate::{Error, Result};

use super::cache::LocalActivityCache;
use super::multiplexer::{ControlTransport, SubscriptionMultiplexer};
use super::tabs::TabCoordinator;

/// Type alias for the WebSocket stream type.
type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection state enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none wanted (or between attempts).
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Live connection.
    Connected,
    /// Server rejected the credential; waiting for a new one.
    AuthRequired,
    /// Reconnect attempts exhausted; waiting for a manual retry.
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// True when only a fresh credential can restart the connection.
    pub fn is_auth_required(&self) -> bool {
        matches!(self, ConnectionState::AuthRequired)
    }

    /// True when only a manual retry (or a credential/tab change) can
    /// restart the connection.
    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionState::Error)
    }
}

/// Exponential backoff delay for a reconnect attempt (1-based).
///
/// Attempt 1: base (2s with defaults)
/// Attempt 2: 4s
/// Attempt 3: 8s
/// Attempt 4: 16s
/// Attempt 5+: capped at 30s
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(2u32.saturating_pow(exponent)).min(cap)
}

/// When the next heartbeat goes out: the visibility-scaled interval after
/// the previous send, floored at the coalescing window so interval changes
/// can never stack sends.
fn next_heartbeat_due(last_sent: Instant, interval: Duration, coalesce: Duration) -> Instant {
    last_sent + interval.max(coalesce)
}

/// Handshake URL with the credential riding in the query string.
///
/// Browsers cannot set headers on WebSocket upgrades, so the token goes in
/// `?token=`; it is percent-encoded so reserved characters survive the trip.
fn handshake_url(base: &str, token: &str) -> String {
    format!("{}?token={}", base, urlencoding::encode(token))
}

/// Sends subscription control messages from the multiplexer to the
/// connection manager's outbound loop.
pub struct ControlChannel {
    tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ControlChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ControlMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ControlTransport for ControlChannel {
    fn subscribe(&self, topic: &Topic) {
        let _ = self.tx.send(ControlMessage {
            action: ControlAction::Subscribe,
            topic: topic.clone(),
        });
    }

    fn unsubscribe(&self, topic: &Topic) {
        let _ = self.tx.send(ControlMessage {
            action: ControlAction::Unsubscribe,
            topic: topic.clone(),
        });
    }
}

/// Shared observer for connection state plus the manual-retry affordance.
#[derive(Clone)]
pub struct ConnectionStatus {
    state: Arc<Mutex<ConnectionState>>,
    last_error: Arc<Mutex<Option<Error>>>,
    retry: Arc<Notify>,
}

impl ConnectionStatus {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            last_error: Arc::new(Mutex::new(None)),
            retry: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The error behind an `AuthRequired` or `Error` state, rendered for
    /// display. Cleared on the next successful connect.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|e| e.to_string())
    }

    /// Request a reconnect from the `Error` state.
    pub fn retry(&self) {
        self.retry.notify_one();
    }

    fn set(&self, state: ConnectionState) {
        if state.is_connected() {
            *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
        }
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn fail(&self, state: ConnectionState, error: Error) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
        self.set(state);
    }
}

/// Why a connect-and-run round ended without a transport error.
enum Disconnect {
    /// Auth or tab gate closed; do not reconnect until it reopens.
    Gated,
    /// Credential rotated; reconnect immediately with the new one.
    CredentialChanged,
}

/// Browser-side component owning the transport connection.
pub struct ClientConnectionManager {
    url: String,
    config: ClientConfig,
    mux: Arc<SubscriptionMultiplexer>,
    tabs: Arc<TabCoordinator>,
    cache: Arc<LocalActivityCache>,
    auth_rx: watch::Receiver<Option<String>>,
    desired_rx: watch::Receiver<bool>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    status: ConnectionStatus,
}

impl ClientConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: String,
        config: ClientConfig,
        mux: Arc<SubscriptionMultiplexer>,
        tabs: Arc<TabCoordinator>,
        cache: Arc<LocalActivityCache>,
        auth_rx: watch::Receiver<Option<String>>,
        desired_rx: watch::Receiver<bool>,
        control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    ) -> Self {
        Self {
            url,
            config,
            mux,
            tabs,
            cache,
            auth_rx,
            desired_rx,
            control_rx,
            status: ConnectionStatus::new(),
        }
    }

    /// Observer handle for state and manual retry.
    pub fn status(&self) -> ConnectionStatus {
        self.status.clone()
    }

    fn gate_open(&self) -> bool {
        self.auth_rx.borrow().is_some() && *self.desired_rx.borrow()
    }

    /// Run the connection loop until both watch senders are gone.
    ///
    /// Call this in a spawned task; it never blocks the caller.
    pub async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            if !self.gate_open() {
                self.status.set(ConnectionState::Disconnected);
                attempt = 0;
                tokio::select! {
                    res = self.auth_rx.changed() => if res.is_err() { return },
                    res = self.desired_rx.changed() => if res.is_err() { return },
                }
                continue;
            }

            self.status.set(ConnectionState::Connecting);
            let token = match self.auth_rx.borrow().clone() {
                Some(token) => token,
                None => continue,
            };

            match self.connect_and_run(&token).await {
                Ok(Disconnect::Gated) => {
                    info!("disconnected (logout or no tabs)");
                    self.status.set(ConnectionState::Disconnected);
                    attempt = 0;
                }
                Ok(Disconnect::CredentialChanged) => {
                    debug!("credential rotated; reconnecting");
                    attempt = 0;
                }
                Err(Error::AuthRejected) => {
                    warn!("handshake rejected; holding until the credential changes");
                    self.status.fail(ConnectionState::AuthRequired, Error::AuthRejected);
                    attempt = 0;
                    // A rejected credential is never presented again: no
                    // backoff timer runs, and only a credential change (or
                    // the tab gate closing) wakes the loop.
                    loop {
                        tokio::select! {
                            res = self.auth_rx.changed() => {
                                if res.is_err() { return }
                                break;
                            }
                            res = self.desired_rx.changed() => {
                                if res.is_err() { return }
                                if !*self.desired_rx.borrow() { break; }
                            }
                        }
                    }
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_reconnect_attempts {
                        warn!(
                            error = %e,
                            attempts = self.config.max_reconnect_attempts,
                            "reconnect attempts exhausted"
                        );
                        self.status.fail(
                            ConnectionState::Error,
                            Error::ReconnectExhausted(self.config.max_reconnect_attempts),
                        );
                        // All background timers stop here; only a manual
                        // retry or a gate change wakes the loop.
                        let retry = self.status.retry.clone();
                        tokio::select! {
                            _ = retry.notified() => info!("manual reconnect requested"),
                            res = self.auth_rx.changed() => if res.is_err() { return },
                            res = self.desired_rx.changed() => if res.is_err() { return },
                        }
                        attempt = 0;
                        continue;
                    }
                    let delay = backoff_delay(
                        attempt,
                        Duration::from_secs(self.config.backoff_base_secs),
                        Duration::from_secs(self.config.backoff_cap_secs),
                    );
                    debug!(error = %e, attempt, delay_secs = delay.as_secs(), "backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.auth_rx.changed() => {}
                        _ = self.desired_rx.changed() => {}
                    }
                }
            }
        }
    }

    /// Connect, recover subscriptions, and pump frames until the connection
    /// ends. A transport failure is an error (the caller backs off); a
    /// gate-driven teardown is a clean disconnect.
    async fn connect_and_run(&mut self, token: &str) -> Result<Disconnect> {
        let url = handshake_url(&self.url, token);
        let (ws_stream, _response): (WsStream, _) = match connect_async(&url).await {
            Ok(pair) => pair,
            Err(tungstenite::Error::Http(response))
                if response.status() == StatusCode::UNAUTHORIZED
                    || response.status() == StatusCode::FORBIDDEN =>
            {
                return Err(Error::AuthRejected);
            }
            Err(e) => return Err(e.into()),
        };
        self.status.set(ConnectionState::Connected);
        info!("connected to activity server");

        let (mut write, mut read) = ws_stream.split();

        // Control traffic queued while offline is stale; the multiplexer
        // snapshot below is the authority for what is subscribed.
        while self.control_rx.try_recv().is_ok() {}

        // Recovery of state across reconnects.
        for topic in self.mux.active_topics() {
            let frame = ClientFrame::Control(ControlMessage {
                action: ControlAction::Subscribe,
                topic,
            });
            write.send(Message::Text(frame.encode()?)).await?;
        }

        let coalesce = Duration::from_secs(self.config.heartbeat_coalesce_secs);
        let mut last_heartbeat = Instant::now();
        // First heartbeat goes out promptly so the server's liveness stamp
        // starts from a frame, not just the handshake.
        write
            .send(Message::Text(ClientFrame::Heartbeat(Heartbeat::now()).encode()?))
            .await?;

        loop {
            // Adaptive interval: slower while every tab is hidden.
            let interval = if self.tabs.any_visible() {
                Duration::from_secs(self.config.heartbeat_visible_secs)
            } else {
                Duration::from_secs(self.config.heartbeat_hidden_secs)
            };
            let heartbeat_due = next_heartbeat_due(last_heartbeat, interval, coalesce);

            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(Error::Other("server closed connection".to_string()));
                        }
                        Some(Err(e)) => return Err(e.into()),
                        _ => {}
                    }
                }
                ctrl = self.control_rx.recv() => {
                    if let Some(ctrl) = ctrl {
                        write.send(Message::Text(ClientFrame::Control(ctrl).encode()?)).await?;
                    }
                }
                _ = tokio::time::sleep_until(heartbeat_due) => {
                    write
                        .send(Message::Text(ClientFrame::Heartbeat(Heartbeat::now()).encode()?))
                        .await?;
                    last_heartbeat = Instant::now();
                }
                res = self.auth_rx.changed() => {
                    if res.is_err() || self.auth_rx.borrow().is_none() {
                        // Logged out (or shutting down): close without retry.
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(Disconnect::Gated);
                    }
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(Disconnect::CredentialChanged);
                }
                res = self.desired_rx.changed() => {
                    if res.is_err() || !*self.desired_rx.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(Disconnect::Gated);
                    }
                }
            }
        }
    }

    /// Handle one inbound text frame. A malformed frame is discarded and
    /// logged; the connection stays up.
    fn handle_frame(&self, text: &str) {
        match ServerFrame::decode(text) {
            Ok(ServerFrame::Event(event)) => self.deliver(event),
            Ok(ServerFrame::Heartbeat(_)) => {
                debug!("server heartbeat");
            }
            Err(e) => {
                warn!(error = %e, "discarding malformed frame");
            }
        }
    }

    /// Persist and dispatch one live event.
    ///
    /// The cache write happens for every subscribed matching topic; dispatch
    /// is deferred through the tab coordinator's hidden queue when no tab is
    /// visible.
    fn deliver(&self, event: ActivityEvent) {
        for topic in event.topics() {
            if self.mux.is_subscribed(&topic) {
                if let Err(e) = self.cache.append(&topic, &event) {
                    warn!(topic = %topic, error = %e, "cache append failed");
                }
            }
        }
        if self.tabs.any_visible() {
            self.mux.dispatch(&event);
        } else {
            self.tabs.queue_hidden(event);
        }
    }
}
