//! The engine facade used by the server.

use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use parley_core::constants::{
    CALL_RESPONSE_WINDOW, MAX_CONTENT_LENGTH, PRESENCE_DEBOUNCE, TYPING_WINDOW,
};
use parley_core::model::{Conversation, Presence, UserProfile};
use parley_core::{ChatError, Result, SessionId, UserId};
use parley_store::ChatStore;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{ClientEvent, ServerEvent};
use crate::metrics::SESSIONS_ACTIVE;
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomIndex;
use crate::router::{Actor, EventRouter};
use crate::session::Session;

/// Timing and sizing knobs of the engine.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Silence after which a typing state expires.
    pub typing_window: Duration,
    /// How long invitees have to answer a call.
    pub call_response_window: Duration,
    /// Trailing-edge debounce for presence notifications.
    pub presence_debounce: Duration,
    /// Maximum message length in characters.
    pub max_content_length: usize,
    /// Outbound frames buffered per session before drops.
    pub send_queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            typing_window: TYPING_WINDOW,
            call_response_window: CALL_RESPONSE_WINDOW,
            presence_debounce: PRESENCE_DEBOUNCE,
            max_content_length: MAX_CONTENT_LENGTH,
            send_queue_capacity: 256,
        }
    }
}

/// Owns the registry, room index, router, and presence tracker.
pub struct SyncEngine {
    store: Arc<dyn ChatStore>,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomIndex>,
    router: EventRouter,
    presence: Arc<PresenceTracker>,
    config: SyncConfig,
}

impl SyncEngine {
    /// Build an engine over `store`.
    pub fn new(store: Arc<dyn ChatStore>, config: SyncConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomIndex::new());
        let router = EventRouter::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&rooms),
            &config,
        );
        let presence = PresenceTracker::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            router.fanout().clone(),
            config.presence_debounce,
        );
        Self {
            store,
            registry,
            rooms,
            router,
            presence,
            config,
        }
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    /// Connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Room index.
    pub fn rooms(&self) -> &Arc<RoomIndex> {
        &self.rooms
    }

    /// Event router, also used directly by REST handlers.
    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Resolve an authenticated user id to a profile.
    pub async fn authenticate(&self, user: &UserId) -> Result<UserProfile> {
        self.store
            .user(user)
            .await?
            .ok_or_else(|| ChatError::unauthorized(format!("unknown user {user}")))
    }

    /// Register a live session, subscribe it to the user's conversations,
    /// send it the online snapshot, and feed presence.
    ///
    /// Returns the session and the receiving end of its outbound queue.
    pub async fn connect(&self, user: UserProfile) -> (Arc<Session>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(self.config.send_queue_capacity.max(1));
        let registered = self.registry.register(user, tx);
        let session = registered.session;

        match self.store.conversations_for_user(session.user_id()).await {
            Ok(conversations) => self.subscribe_all(&session, &conversations).await,
            Err(e) => {
                warn!(session_id = %session.id(), error = %e, "failed to load conversations on connect");
            }
        }
        // A disconnect that raced the subscriptions above must not leave them behind.
        if self.registry.session(session.id()).is_none() {
            let _ = self.rooms.remove_session(session.id());
        }

        let snapshot = ServerEvent::OnlineUsers {
            users: self.registry.online_users(),
        };
        let _ = self.router.fanout().to_session(&session, &snapshot);

        if registered.first_for_user {
            self.presence.record_transition(session.user());
        }
        self.record_session_gauge();
        info!(
            session_id = %session.id(),
            user_id = %session.user_id(),
            first = registered.first_for_user,
            "session connected"
        );
        (session, rx)
    }

    /// Subscribe a new session to each listed conversation. The list may be
    /// stale by now, so each subscription re-checks membership.
    async fn subscribe_all(&self, session: &Session, conversations: &[Conversation]) {
        for conversation in conversations {
            match self.router.subscribe(session.id(), &conversation.id).await {
                Ok(_) => {}
                Err(ChatError::NotFound { entity: "session", .. }) => return,
                Err(e) => {
                    debug!(
                        session_id = %session.id(),
                        conversation_id = %conversation.id,
                        error = %e,
                        "skipped subscription on connect"
                    );
                }
            }
        }
    }

    /// Remove a session and its subscriptions. Safe to call twice.
    pub fn disconnect(&self, session_id: &SessionId) {
        let Some(gone) = self.registry.unregister(session_id) else {
            return;
        };
        let rooms = self.rooms.remove_session(session_id);
        if gone.last_for_user {
            self.router.clear_typing(gone.session.user());
            self.presence.record_transition(gone.session.user());
        }
        self.record_session_gauge();
        info!(
            session_id = %session_id,
            user_id = %gone.session.user_id(),
            rooms = rooms.len(),
            dropped = gone.session.drop_count(),
            last = gone.last_for_user,
            "session disconnected"
        );
    }

    /// Handle one inbound event from a live session.
    pub async fn handle(&self, session: &Session, event: ClientEvent) -> Result<Value> {
        self.router.dispatch(&Actor::live(session), event).await
    }

    /// Handle a raw text frame and build the ack. Frames without an `id`
    /// only get an ack when they fail.
    pub async fn handle_frame(&self, session: &Session, text: &str) -> Option<ServerEvent> {
        let (request_id, event) = crate::events::parse_frame(text);
        let outcome = match event {
            Ok(event) => self.handle(session, event).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(result) => request_id.map(|id| ServerEvent::ack_ok(Some(id), result)),
            Err(e) => Some(ServerEvent::ack_err(request_id, &e)),
        }
    }

    /// Users with at least one live session.
    pub fn online_users(&self) -> Vec<UserProfile> {
        self.registry.online_users()
    }

    /// Presence of one user.
    pub async fn presence(&self, user: &UserId) -> Result<Presence> {
        self.presence.snapshot(user).await
    }

    /// Presence of the actor's friends.
    pub async fn friends_presence(&self, user: &UserId) -> Result<Vec<Presence>> {
        let friends = self.store.friend_ids(user).await?;
        let mut out = Vec::with_capacity(friends.len());
        for friend in &friends {
            out.push(self.presence.snapshot(friend).await?);
        }
        Ok(out)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_session_gauge(&self) {
        gauge!(SESSIONS_ACTIVE).set(self.registry.len() as f64);
    }
}
