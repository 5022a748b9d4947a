//! Typing state: idle ↔ typing per (conversation, user), with self-expiry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use parley_core::{ConversationId, UserId};
use tokio::time::Instant;

use crate::timer::{self, Timer};

type Key = (ConversationId, UserId);

/// Outcome of [`TypingTracker::start`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypingChange {
    /// idle → typing; observers should be told.
    Started,
    /// Already typing; only the expiry moved.
    Renewed,
}

struct Entry {
    generation: u64,
    expires_at: Instant,
    _timer: Timer,
}

/// Tracks who is typing where. Each entry owns its expiry timer, so
/// replacing or removing an entry cancels the timer with it.
pub struct TypingTracker {
    window: Duration,
    entries: Mutex<HashMap<Key, Entry>>,
    generation: AtomicU64,
}

impl TypingTracker {
    /// Create a tracker whose entries expire after `window` of silence.
    pub fn new(window: Duration) -> Arc<Self> {
        Arc::new(Self {
            window,
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    /// Inactivity window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a typing signal and (re)arm the expiry.
    ///
    /// `on_expire` runs once if no further `start` or `stop` arrives within
    /// the window; a renewal or stop makes the earlier callback a no-op.
    pub fn start<F, Fut>(
        self: &Arc<Self>,
        conversation: &ConversationId,
        user: &UserId,
        on_expire: F,
    ) -> TypingChange
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let key = (conversation.clone(), user.clone());
        let tracker = Arc::downgrade(self);
        let timer_key = key.clone();
        let timer = timer::schedule(self.window, async move {
            let Some(tracker) = tracker.upgrade() else {
                return;
            };
            if tracker.expire(&timer_key, generation) {
                on_expire().await;
            }
        });
        let entry = Entry {
            generation,
            expires_at: Instant::now() + self.window,
            _timer: timer,
        };
        match self.entries.lock().insert(key, entry) {
            Some(_) => TypingChange::Renewed,
            None => TypingChange::Started,
        }
    }

    /// Explicit stop. Returns `true` if the user was typing.
    pub fn stop(&self, conversation: &ConversationId, user: &UserId) -> bool {
        let key = (conversation.clone(), user.clone());
        self.entries.lock().remove(&key).is_some()
    }

    /// Whether `user` is typing in `conversation`.
    pub fn is_typing(&self, conversation: &ConversationId, user: &UserId) -> bool {
        let key = (conversation.clone(), user.clone());
        self.entries.lock().contains_key(&key)
    }

    /// When the current typing state of `user` expires.
    pub fn expires_at(&self, conversation: &ConversationId, user: &UserId) -> Option<Instant> {
        let key = (conversation.clone(), user.clone());
        self.entries.lock().get(&key).map(|e| e.expires_at)
    }

    /// Users typing in `conversation`.
    pub fn typing_in(&self, conversation: &ConversationId) -> Vec<UserId> {
        self.entries
            .lock()
            .keys()
            .filter(|(c, _)| c == conversation)
            .map(|(_, u)| u.clone())
            .collect()
    }

    /// Drop every entry of `user` without firing callbacks. Returns the
    /// conversations the user was typing in.
    pub fn clear_user(&self, user: &UserId) -> Vec<ConversationId> {
        let mut entries = self.entries.lock();
        let keys: Vec<Key> = entries.keys().filter(|(_, u)| u == user).cloned().collect();
        for key in &keys {
            let _ = entries.remove(key);
        }
        keys.into_iter().map(|(c, _)| c).collect()
    }

    fn expire(&self, key: &Key, generation: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.generation == generation => {
                let _ = entries.remove(key);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    const WINDOW: Duration = Duration::from_secs(2);

    fn ids() -> (ConversationId, UserId) {
        (ConversationId::from("c1"), UserId::from("a"))
    }

    fn start(
        tracker: &Arc<TypingTracker>,
        fired: &Arc<AtomicUsize>,
    ) -> TypingChange {
        let (c, u) = ids();
        let fired = Arc::clone(fired);
        tracker.start(&c, &u, move || async move {
            let _ = fired.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn silence_expires_exactly_once() {
        let tracker = TypingTracker::new(WINDOW);
        let fired = Arc::new(AtomicUsize::new(0));
        assert_eq!(start(&tracker, &fired), TypingChange::Started);

        tokio::time::sleep(WINDOW * 5).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let (c, u) = ids();
        assert!(!tracker.is_typing(&c, &u));
    }

    #[tokio::test(start_paused = true)]
    async fn renewals_extend_and_fire_once() {
        let tracker = TypingTracker::new(WINDOW);
        let fired = Arc::new(AtomicUsize::new(0));
        assert_eq!(start(&tracker, &fired), TypingChange::Started);
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            assert_eq!(start(&tracker, &fired), TypingChange::Renewed);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(WINDOW + Duration::from_millis(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_cancels_expiry() {
        let tracker = TypingTracker::new(WINDOW);
        let fired = Arc::new(AtomicUsize::new(0));
        let _ = start(&tracker, &fired);
        let (c, u) = ids();
        assert!(tracker.stop(&c, &u));
        assert!(!tracker.stop(&c, &u));
        tokio::time::sleep(WINDOW * 3).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_in_lists_users() {
        let tracker = TypingTracker::new(WINDOW);
        let c = ConversationId::from("c1");
        let _ = tracker.start(&c, &UserId::from("a"), || async {});
        let _ = tracker.start(&c, &UserId::from("b"), || async {});
        let _ = tracker.start(&ConversationId::from("c2"), &UserId::from("a"), || async {});
        let mut users = tracker.typing_in(&c);
        users.sort();
        assert_eq!(users, vec![UserId::from("a"), UserId::from("b")]);
        assert!(tracker.expires_at(&c, &UserId::from("a")).is_some());

        let mut cleared = tracker.clear_user(&UserId::from("a"));
        cleared.sort();
        assert_eq!(cleared.len(), 2);
        assert_eq!(tracker.typing_in(&c), vec![UserId::from("b")]);
    }
}
