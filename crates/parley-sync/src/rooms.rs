//! Room membership index: which live sessions receive a conversation's events.
//!
//! Only sessions of authorized participants may be inserted; the index
//! itself does not check, the router does before calling [`RoomIndex::subscribe`].

use std::collections::HashSet;

use dashmap::DashMap;
use parley_core::{ConversationId, SessionId};

/// Conversation → subscribed sessions, plus the reverse map for disconnect cleanup.
///
/// Each conversation's set is mutated under its shard lock, so concurrent
/// subscribe/unsubscribe on one conversation never lose an update and
/// unrelated conversations do not contend.
#[derive(Default)]
pub struct RoomIndex {
    rooms: DashMap<ConversationId, HashSet<SessionId>>,
    by_session: DashMap<SessionId, HashSet<ConversationId>>,
}

impl RoomIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a session. Returns `true` if it was not subscribed before.
    pub fn subscribe(&self, session: &SessionId, conversation: &ConversationId) -> bool {
        let inserted = self
            .rooms
            .entry(conversation.clone())
            .or_default()
            .insert(session.clone());
        let _ = self
            .by_session
            .entry(session.clone())
            .or_default()
            .insert(conversation.clone());
        inserted
    }

    /// Unsubscribe a session. Returns `true` if it was subscribed.
    pub fn unsubscribe(&self, session: &SessionId, conversation: &ConversationId) -> bool {
        let removed = self
            .rooms
            .get_mut(conversation)
            .is_some_and(|mut set| set.remove(session));
        let _ = self.rooms.remove_if(conversation, |_, set| set.is_empty());
        if let Some(mut convs) = self.by_session.get_mut(session) {
            let _ = convs.remove(conversation);
        }
        let _ = self.by_session.remove_if(session, |_, set| set.is_empty());
        removed
    }

    /// Drop every subscription of a session. Returns the conversations it left.
    pub fn remove_session(&self, session: &SessionId) -> Vec<ConversationId> {
        let Some((_, conversations)) = self.by_session.remove(session) else {
            return Vec::new();
        };
        for conversation in &conversations {
            if let Some(mut set) = self.rooms.get_mut(conversation) {
                let _ = set.remove(session);
            }
            let _ = self.rooms.remove_if(conversation, |_, set| set.is_empty());
        }
        conversations.into_iter().collect()
    }

    /// Sessions currently subscribed to a conversation.
    pub fn members_of(&self, conversation: &ConversationId) -> Vec<SessionId> {
        self.rooms
            .get(conversation)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a session is subscribed to a conversation.
    pub fn is_subscribed(&self, session: &SessionId, conversation: &ConversationId) -> bool {
        self.rooms
            .get(conversation)
            .is_some_and(|set| set.contains(session))
    }

    /// Conversations a session is subscribed to.
    pub fn rooms_of(&self, session: &SessionId) -> Vec<ConversationId> {
        self.by_session
            .get(session)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of conversations with at least one subscriber.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
