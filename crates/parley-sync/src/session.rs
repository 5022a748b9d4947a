//! A single live connection of a user.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use parley_core::model::UserProfile;
use parley_core::{SessionId, UserId};
use tokio::sync::mpsc;

/// One connected device or tab. A user may hold several at once.
///
/// Outbound frames go through a bounded queue; a full queue drops the frame
/// and bumps [`Session::drop_count`] instead of blocking the sender.
pub struct Session {
    id: SessionId,
    user: UserProfile,
    tx: mpsc::Sender<Arc<String>>,
    connected_at: DateTime<Utc>,
    started: Instant,
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    dropped_frames: AtomicU64,
}

impl Session {
    /// Create a session for `user` that writes into `tx`.
    pub fn new(user: UserProfile, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            id: SessionId::new(),
            user,
            tx,
            connected_at: Utc::now(),
            started: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Profile of the authenticated user.
    pub fn user(&self) -> &UserProfile {
        &self.user
    }

    /// Shortcut for `self.user().id`.
    pub fn user_id(&self) -> &UserId {
        &self.user.id
    }

    /// Wall-clock time the session was registered.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Queue a serialized frame. Returns `false` if the queue is full or closed.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Frames dropped because the queue was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Whether the outbound queue has been closed by the transport.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    // ── Liveness ────────────────────────────────────────────────────

    /// Record a pong from the peer.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Time since the last pong.
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Read and clear the alive flag. Returns whether a pong arrived since
    /// the previous check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the session was created.
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.user.id)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> UserProfile {
        UserProfile {
            id: UserId::from("alice"),
            name: "Alice".into(),
            avatar: None,
        }
    }

    #[test]
    fn send_queues_frame() {
        let (tx, mut rx) = mpsc::channel(4);
        let session = Session::new(profile(), tx);
        assert!(session.send(Arc::new("hello".into())));
        assert_eq!(rx.try_recv().unwrap().as_str(), "hello");
        assert_eq!(session.drop_count(), 0);
    }

    #[test]
    fn full_queue_counts_drops() {
        let (tx, _rx) = mpsc::channel(1);
        let session = Session::new(profile(), tx);
        assert!(session.send(Arc::new("one".into())));
        assert!(!session.send(Arc::new("two".into())));
        assert!(!session.send(Arc::new("three".into())));
        assert_eq!(session.drop_count(), 2);
    }

    #[test]
    fn closed_queue_fails() {
        let (tx, rx) = mpsc::channel(4);
        let session = Session::new(profile(), tx);
        drop(rx);
        assert!(session.is_closed());
        assert!(!session.send(Arc::new("x".into())));
    }

    #[test]
    fn check_alive_resets_flag() {
        let (tx, _rx) = mpsc::channel(1);
        let session = Session::new(profile(), tx);
        assert!(session.check_alive());
        assert!(!session.check_alive());
        session.mark_alive();
        assert!(session.check_alive());
    }

    #[test]
    fn sessions_get_distinct_ids() {
        let (tx, _rx) = mpsc::channel(1);
        let a = Session::new(profile(), tx.clone());
        let b = Session::new(profile(), tx);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.user_id(), b.user_id());
    }
}
