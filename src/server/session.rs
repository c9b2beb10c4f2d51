//! Server-side connection session state.
//!
//! One `ConnectionSession` exists per live transport connection. It owns the
//! outbound queue; the topic registry holds it only for routing. The state
//! machine is `HANDSHAKING -> ACTIVE -> CLOSING -> CLOSED`:
//!
//! - `HANDSHAKING -> ACTIVE` on successful credential validation
//! - `ACTIVE -> CLOSING` on transport error, unsubscribe-all, or a missed
//!   heartbeat deadline (3x the expected interval)
//! - `CLOSING -> CLOSED` once the outbound queue drains or the grace
//!   timeout elapses

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::queue::OutboundQueue;

/// Unique id for one transport connection.
pub type SessionId = Uuid;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

/// One live client connection and its delivery queue.
#[derive(Debug)]
pub struct ConnectionSession {
    pub id: SessionId,
    pub user_id: String,
    queue: Arc<OutboundQueue>,
    state: Mutex<SessionState>,
    last_heartbeat: Mutex<DateTime<Utc>>,
}

impl ConnectionSession {
    /// Create a session in `HANDSHAKING` with a fresh bounded queue.
    pub fn new(user_id: impl Into<String>, queue_capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            queue: Arc::new(OutboundQueue::new(queue_capacity)),
            state: Mutex::new(SessionState::Handshaking),
            last_heartbeat: Mutex::new(Utc::now()),
        }
    }

    fn state_guard(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SessionState {
        *self.state_guard()
    }

    /// The session's outbound queue. Shared with the registry for enqueues
    /// and with the delivery loop for draining.
    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    /// `HANDSHAKING -> ACTIVE`, after the auth collaborator accepted the
    /// credential. No-op from any other state.
    pub fn activate(&self) {
        let mut state = self.state_guard();
        if *state == SessionState::Handshaking {
            *state = SessionState::Active;
        }
    }

    /// `ACTIVE -> CLOSING`. The queue stops accepting frames and drains.
    pub fn begin_close(&self) {
        let mut state = self.state_guard();
        if *state == SessionState::Active || *state == SessionState::Handshaking {
            *state = SessionState::Closing;
            self.queue.close_graceful();
        }
    }

    /// `CLOSING -> CLOSED`. Hard-closes the queue; anything still buffered
    /// after the drain grace period is discarded.
    pub fn finish_close(&self) {
        let mut state = self.state_guard();
        *state = SessionState::Closed;
        self.queue.close_now();
    }

    /// Stamp heartbeat arrival (any inbound liveness counts).
    pub fn record_heartbeat(&self) {
        let mut last = self.last_heartbeat.lock().unwrap_or_else(|e| e.into_inner());
        *last = Utc::now();
    }

    pub fn last_heartbeat_at(&self) -> DateTime<Utc> {
        *self.last_heartbeat.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the heartbeat deadline has passed.
    pub fn heartbeat_expired(&self, deadline: Duration) -> bool {
        let elapsed = Utc::now() - self.last_heartbeat_at();
        elapsed.num_milliseconds().max(0) as u128 >= deadline.as_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_handshaking() {
        let session = ConnectionSession::new("u-1", 8);
        assert_eq!(session.state(), SessionState::Handshaking);
        assert!(!session.state().is_active());
        assert_eq!(session.user_id, "u-1");
    }

    #[test]
    fn test_activate_transitions_to_active() {
        let session = ConnectionSession::new("u-1", 8);
        session.activate();
        assert!(session.state().is_active());
        // Idempotent
        session.activate();
        assert!(session.state().is_active());
    }

    #[test]
    fn test_close_sequence() {
        let session = ConnectionSession::new("u-1", 8);
        session.activate();
        session.begin_close();
        assert_eq!(session.state(), SessionState::Closing);
        session.finish_close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.state().is_terminal());
    }

    #[test]
    fn test_activate_after_close_is_ignored() {
        let session = ConnectionSession::new("u-1", 8);
        session.activate();
        session.begin_close();
        session.activate();
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[test]
    fn test_heartbeat_deadline() {
        let session = ConnectionSession::new("u-1", 8);
        session.record_heartbeat();
        assert!(!session.heartbeat_expired(Duration::from_secs(90)));
        assert!(session.heartbeat_expired(Duration::from_millis(0)));
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = ConnectionSession::new("u-1", 8);
        let b = ConnectionSession::new("u-1", 8);
        assert_ne!(a.id, b.id);
    }
}
