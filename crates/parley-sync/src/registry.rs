//! Connection registry: user ↔ live sessions.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use parley_core::model::UserProfile;
use parley_core::{SessionId, UserId};
use tokio::sync::mpsc;

use crate::session::Session;

/// Result of [`ConnectionRegistry::register`].
#[derive(Debug)]
pub struct Registered {
    /// The new session.
    pub session: Arc<Session>,
    /// Whether this is the user's only session (offline → online).
    pub first_for_user: bool,
}

/// Result of [`ConnectionRegistry::unregister`].
#[derive(Debug)]
pub struct Unregistered {
    /// The removed session.
    pub session: Arc<Session>,
    /// Whether the user has no sessions left (online → offline).
    pub last_for_user: bool,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Arc<Session>>,
    by_user: HashMap<UserId, Vec<SessionId>>,
}

/// Tracks every live session and which user owns it.
///
/// A user is online exactly while at least one of their sessions is
/// registered. Both maps change under one lock, so readers never observe a
/// session in one map but not the other.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session for `user`.
    pub fn register(&self, user: UserProfile, tx: mpsc::Sender<Arc<String>>) -> Registered {
        let session = Arc::new(Session::new(user, tx));
        let mut inner = self.inner.lock();
        let ids = inner.by_user.entry(session.user_id().clone()).or_default();
        let first_for_user = ids.is_empty();
        ids.push(session.id().clone());
        let _ = inner
            .sessions
            .insert(session.id().clone(), Arc::clone(&session));
        Registered {
            session,
            first_for_user,
        }
    }

    /// Remove a session. Unknown ids return `None`, so a double disconnect is harmless.
    pub fn unregister(&self, id: &SessionId) -> Option<Unregistered> {
        let mut inner = self.inner.lock();
        let session = inner.sessions.remove(id)?;
        let mut last_for_user = true;
        if let Some(ids) = inner.by_user.get_mut(session.user_id()) {
            ids.retain(|s| s != id);
            last_for_user = ids.is_empty();
        }
        if last_for_user {
            let _ = inner.by_user.remove(session.user_id());
        }
        Some(Unregistered {
            session,
            last_for_user,
        })
    }

    /// Look up one session.
    pub fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.inner.lock().sessions.get(id).cloned()
    }

    /// All sessions of `user`, oldest first.
    pub fn sessions_for(&self, user: &UserId) -> Vec<Arc<Session>> {
        let inner = self.inner.lock();
        inner
            .by_user
            .get(user)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.sessions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Session ids of `user`.
    pub fn session_ids_for(&self, user: &UserId) -> Vec<SessionId> {
        self.inner
            .lock()
            .by_user
            .get(user)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `user` has at least one live session.
    pub fn is_online(&self, user: &UserId) -> bool {
        self.inner.lock().by_user.contains_key(user)
    }

    /// Ids of every online user.
    pub fn all_online_user_ids(&self) -> Vec<UserId> {
        self.inner.lock().by_user.keys().cloned().collect()
    }

    /// Profiles of every online user, one entry per user.
    pub fn online_users(&self) -> Vec<UserProfile> {
        let inner = self.inner.lock();
        let mut users: Vec<UserProfile> = inner
            .by_user
            .values()
            .filter_map(|ids| ids.first())
            .filter_map(|id| inner.sessions.get(id))
            .map(|s| s.user().clone())
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of online users.
    pub fn user_count(&self) -> usize {
        self.inner.lock().by_user.len()
    }
}
