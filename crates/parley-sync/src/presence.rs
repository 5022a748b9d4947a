//! Presence tracking with trailing-edge debounce.
//!
//! Connect and disconnect transitions only schedule a settle. When the
//! debounce window elapses the tracker compares the registry's current
//! state with what friends were last told; a reconnect storm that ends
//! where it started produces no notification at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use parking_lot::Mutex;
use parley_core::model::{Presence, UserProfile};
use parley_core::{Result, UserId};
use parley_store::ChatStore;
use tracing::{error, info};

use crate::events::ServerEvent;
use crate::fanout::Fanout;
use crate::metrics::{PRESENCE_TRANSITIONS_TOTAL, STORE_FAILURES_TOTAL};
use crate::registry::ConnectionRegistry;
use crate::timer::{self, Timer};

#[derive(Default)]
struct Entry {
    announced_online: bool,
    pending: Option<Timer>,
}

/// Derives online/offline notifications from registry transitions.
pub struct PresenceTracker {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn ChatStore>,
    fanout: Fanout,
    debounce: Duration,
    state: Mutex<HashMap<UserId, Entry>>,
}

impl PresenceTracker {
    /// Create a tracker. A zero `debounce` settles on the next scheduler tick.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn ChatStore>,
        fanout: Fanout,
        debounce: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            fanout,
            debounce,
            state: Mutex::new(HashMap::new()),
        })
    }

    /// Note that `user` crossed the offline ↔ online boundary in the registry.
    ///
    /// At most one settle is pending per user; it reads the registry when it
    /// fires, so later transitions inside the window fold into it.
    pub fn record_transition(self: &Arc<Self>, user: &UserProfile) {
        let mut state = self.state.lock();
        let entry = state.entry(user.id.clone()).or_default();
        if entry.pending.is_some() {
            return;
        }
        let tracker = Arc::downgrade(self);
        let profile = user.clone();
        entry.pending = Some(timer::schedule(self.debounce, async move {
            if let Some(tracker) = tracker.upgrade() {
                tracker.settle(profile).await;
            }
        }));
    }

    /// Whether friends currently believe `user` is online.
    pub fn announced_online(&self, user: &UserId) -> bool {
        self.state
            .lock()
            .get(user)
            .is_some_and(|e| e.announced_online)
    }

    /// Live presence: online from the registry, last seen from the store.
    pub async fn snapshot(&self, user: &UserId) -> Result<Presence> {
        let stored = self.store.presence(user).await?;
        Ok(Presence {
            user_id: user.clone(),
            is_online: self.registry.is_online(user),
            last_seen: stored.last_seen,
        })
    }

    async fn settle(self: Arc<Self>, user: UserProfile) {
        let now = Utc::now();
        let online = {
            let mut state = self.state.lock();
            let online = self.registry.is_online(&user.id);
            let entry = state.entry(user.id.clone()).or_default();
            entry.pending = None;
            if online == entry.announced_online {
                if !online {
                    let _ = state.remove(&user.id);
                }
                return;
            }
            online
        };
        info!(user_id = %user.id, online, "presence settled");
        counter!(
            PRESENCE_TRANSITIONS_TOTAL,
            "state" => if online { "online" } else { "offline" }
        )
        .increment(1);

        if let Err(e) = self.store.set_presence(&user.id, online, now).await {
            counter!(STORE_FAILURES_TOTAL, "kind" => "set_presence").increment(1);
            error!(user_id = %user.id, error = %e, "failed to persist presence");
        }
        // Announced state only moves once friends were told; the next
        // transition retries.
        let friends = match self.store.friend_ids(&user.id).await {
            Ok(friends) => friends,
            Err(e) => {
                counter!(STORE_FAILURES_TOTAL, "kind" => "friend_ids").increment(1);
                error!(user_id = %user.id, error = %e, "failed to load friends for presence");
                return;
            }
        };
        let event = if online {
            ServerEvent::FriendOnline {
                user_id: user.id.clone(),
                name: user.name.clone(),
            }
        } else {
            ServerEvent::FriendOffline {
                user_id: user.id.clone(),
                name: user.name.clone(),
                last_seen: now,
            }
        };
        let _ = self.fanout.to_users(&friends, &event);
        self.commit(&user, online);
    }

    /// Record what friends were told. A transition that slipped in while the
    /// settle was awaiting the store gets a settle of its own.
    fn commit(self: &Arc<Self>, user: &UserProfile, online: bool) {
        let drifted = {
            let mut state = self.state.lock();
            let entry = state.entry(user.id.clone()).or_default();
            entry.announced_online = online;
            let drifted = entry.pending.is_none() && self.registry.is_online(&user.id) != online;
            if !online && !drifted && entry.pending.is_none() {
                // Offline users keep no entry; the store holds last seen.
                let _ = state.remove(&user.id);
            }
            drifted
        };
        if drifted {
            self.record_transition(user);
        }
    }
}
