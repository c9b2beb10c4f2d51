//! Bounded per-session outbound queue.
//!
//! Every connection session owns one of these. Publishers enqueue frames
//! without ever blocking; the session's delivery loop is the sole consumer
//! and the sole writer to the transport. When the queue is full the oldest
//! buffered non-critical frame is dropped (heartbeats are critical and are
//! never dropped); no gap marker is synthesized, the client reconciles via
//! its periodic full-state refresh.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::sync::Arc;

use tokio::sync::Notify;

/// A frame buffered for delivery to one session.
///
/// The payload is shared across all sessions of a fan-out, so a publish
/// serializes each event exactly once.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub payload: Arc<str>,
    /// Critical frames (heartbeats) survive queue overflow.
    pub critical: bool,
}

impl OutboundFrame {
    pub fn event(payload: Arc<str>) -> Self {
        Self { payload, critical: false }
    }

    pub fn critical(payload: Arc<str>) -> Self {
        Self { payload, critical: true }
    }
}

#[derive(Debug)]
struct Inner {
    frames: VecDeque<OutboundFrame>,
    /// Graceful close: no new frames accepted, pop drains what is buffered.
    closing: bool,
    /// Hard close: pop returns `None` immediately, buffer discarded.
    closed: bool,
    dropped: u64,
}

/// Bounded multi-producer single-consumer frame queue.
#[derive(Debug)]
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be nonzero");
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity.min(64)),
                closing: false,
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means a panicking thread held it; the queue
        // state itself is always consistent between operations.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a frame. Never blocks the caller.
    ///
    /// Returns `false` when the frame was not buffered: the session is
    /// closing or closed, or an all-critical buffer displaced the incoming
    /// non-critical frame.
    pub fn push(&self, frame: OutboundFrame) -> bool {
        {
            let mut inner = self.lock();
            if inner.closing || inner.closed {
                return false;
            }
            if inner.frames.len() >= self.capacity {
                if let Some(pos) = inner.frames.iter().position(|f| !f.critical) {
                    inner.frames.remove(pos);
                    inner.dropped += 1;
                } else if !frame.critical {
                    // Buffer is all-critical; the incoming event is the one
                    // that gives way.
                    inner.dropped += 1;
                    return false;
                } else {
                    inner.frames.pop_front();
                    inner.dropped += 1;
                }
            }
            inner.frames.push_back(frame);
        }
        self.notify.notify_one();
        true
    }

    /// Await the next frame.
    ///
    /// Returns `None` when the queue is hard-closed, or when a graceful close
    /// has been requested and the buffer has drained.
    pub async fn pop(&self) -> Option<OutboundFrame> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                if let Some(frame) = inner.frames.pop_front() {
                    return Some(frame);
                }
                if inner.closing {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting frames; buffered frames still drain through `pop`.
    pub fn close_graceful(&self) {
        self.lock().closing = true;
        self.notify.notify_waiters();
    }

    /// Close immediately, discarding anything buffered.
    pub fn close_now(&self) {
        {
            let mut inner = self.lock();
            inner.closed = true;
            inner.frames.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames discarded by the overflow policy so far.
    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_frame(tag: &str) -> OutboundFrame {
        OutboundFrame::event(Arc::from(tag))
    }

    #[test]
    fn test_overflow_drops_oldest_non_critical() {
        let queue = OutboundQueue::new(2);
        assert!(queue.push(event_frame("a")));
        assert!(queue.push(event_frame("b")));
        assert!(queue.push(event_frame("c")));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_count(), 1);

        let mut inner = queue.lock();
        assert_eq!(&*inner.frames.pop_front().unwrap().payload, "b");
        assert_eq!(&*inner.frames.pop_front().unwrap().payload, "c");
    }

    #[test]
    fn test_overflow_spares_critical_frames() {
        let queue = OutboundQueue::new(2);
        queue.push(OutboundFrame::critical(Arc::from("hb")));
        queue.push(event_frame("a"));
        queue.push(event_frame("b"));

        // "a" gave way; the heartbeat is still first out.
        let mut inner = queue.lock();
        assert!(inner.frames.pop_front().unwrap().critical);
        assert_eq!(&*inner.frames.pop_front().unwrap().payload, "b");
    }

    #[test]
    fn test_overflow_all_critical_drops_incoming_event() {
        let queue = OutboundQueue::new(1);
        assert!(queue.push(OutboundFrame::critical(Arc::from("hb"))));
        assert!(!queue.push(event_frame("a")), "displaced frame must not count as buffered");

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dropped_count(), 1);
        assert!(queue.lock().frames[0].critical);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(OutboundQueue::new(8));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        // Give the consumer a chance to park before pushing.
        tokio::task::yield_now().await;
        queue.push(event_frame("a"));

        let frame = consumer.await.unwrap().unwrap();
        assert_eq!(&*frame.payload, "a");
    }

    #[tokio::test]
    async fn test_graceful_close_drains_then_ends() {
        let queue = OutboundQueue::new(8);
        queue.push(event_frame("a"));
        queue.push(event_frame("b"));
        queue.close_graceful();

        assert!(!queue.push(event_frame("c")), "closing queue accepts no frames");
        assert_eq!(&*queue.pop().await.unwrap().payload, "a");
        assert_eq!(&*queue.pop().await.unwrap().payload, "b");
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_hard_close_discards_buffer() {
        let queue = OutboundQueue::new(8);
        queue.push(event_frame("a"));
        queue.close_now();

        assert!(queue.pop().await.is_none());
        assert!(!queue.push(event_frame("b")));
    }
}
