//! The persistence contract.
//!
//! The engine never issues storage-specific queries; everything it needs
//! goes through [`ChatStore`]. Implementations must be safe to call
//! concurrently and must assign message `seq` values atomically with the
//! insert.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::model::{
    Conversation, FriendRequest, FriendResponse, Membership, Message, MessagePage, NewGroup,
    NewMessage, PageCursor, Presence, Role, UserProfile,
};
use parley_core::{ConversationId, MessageId, UserId};

use crate::errors::Result;

/// Durable record of users, conversations, messages, reactions, and read markers.
#[async_trait]
pub trait ChatStore: Send + Sync {
    // ── Users ───────────────────────────────────────────────────────

    /// Create a user with a fresh id.
    async fn create_user(&self, name: &str, avatar: Option<&str>) -> Result<UserProfile>;

    /// Look up one user.
    async fn user(&self, id: &UserId) -> Result<Option<UserProfile>>;

    /// Look up several users; unknown ids are skipped.
    async fn users(&self, ids: &[UserId]) -> Result<Vec<UserProfile>>;

    /// Persist an online/offline transition.
    async fn set_presence(&self, user: &UserId, online: bool, at: DateTime<Utc>) -> Result<()>;

    /// Last persisted presence of a user.
    async fn presence(&self, user: &UserId) -> Result<Presence>;

    // ── Friends ─────────────────────────────────────────────────────

    /// Users with an active friendship to `user`.
    async fn friend_ids(&self, user: &UserId) -> Result<Vec<UserId>>;

    /// Whether `a` and `b` are friends.
    async fn are_friends(&self, a: &UserId, b: &UserId) -> Result<bool> {
        Ok(self.friend_ids(a).await?.contains(b))
    }

    /// Record a pending request from `from` to `to`.
    async fn send_friend_request(&self, from: &UserId, to: &UserId) -> Result<FriendRequest>;

    /// Resolve the pending request `requester → responder`.
    async fn respond_friend_request(
        &self,
        responder: &UserId,
        requester: &UserId,
        response: FriendResponse,
    ) -> Result<()>;

    /// Withdraw a pending request `from → to`.
    async fn cancel_friend_request(&self, from: &UserId, to: &UserId) -> Result<()>;

    /// End a friendship on both sides.
    async fn remove_friend(&self, user: &UserId, friend: &UserId) -> Result<()>;

    /// Pending requests addressed to `user`.
    async fn pending_friend_requests(&self, user: &UserId) -> Result<Vec<FriendRequest>>;

    // ── Conversations ───────────────────────────────────────────────

    /// Look up one conversation with its members.
    async fn conversation(&self, id: &ConversationId) -> Result<Option<Conversation>>;

    /// Members of a conversation. Fails with `NotFound` for unknown ids.
    async fn conversation_members(&self, id: &ConversationId) -> Result<Vec<Membership>>;

    /// `user`'s membership in `conversation`, if any.
    async fn membership(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<Option<Membership>>;

    /// Conversations `user` participates in, most recently active first.
    async fn conversations_for_user(&self, user: &UserId) -> Result<Vec<Conversation>>;

    /// Direct conversation between `a` and `b`. Returns the existing one when
    /// present; the flag is `true` only when a new conversation was created.
    async fn create_direct_conversation(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> Result<(Conversation, bool)>;

    /// Create a group; the owner gets [`Role::Owner`], everyone else [`Role::Member`].
    async fn create_group_conversation(&self, group: NewGroup) -> Result<Conversation>;

    /// Add a participant. `Conflict` if already a member.
    async fn add_member(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        role: Role,
    ) -> Result<Membership>;

    /// Remove a participant. `NotFound` if not a member.
    async fn remove_member(&self, conversation: &ConversationId, user: &UserId) -> Result<()>;

    /// Change a participant's role.
    async fn update_role(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        role: Role,
    ) -> Result<Membership>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a message, assigning id, next `seq`, and timestamp. Bumps the
    /// conversation's last activity.
    async fn create_message(&self, message: NewMessage) -> Result<Message>;

    /// Look up one message.
    async fn message(&self, id: &MessageId) -> Result<Option<Message>>;

    /// A page of messages ordered oldest-first.
    async fn messages_page(
        &self,
        conversation: &ConversationId,
        cursor: PageCursor,
        limit: usize,
    ) -> Result<MessagePage>;

    /// Replace a message's content and stamp `edited_at`.
    async fn edit_message(&self, id: &MessageId, content: &str, at: DateTime<Utc>)
    -> Result<Message>;

    /// Soft-delete a message.
    async fn delete_message(&self, id: &MessageId, at: DateTime<Utc>) -> Result<Message>;

    /// Set `user`'s reaction on a message, replacing any previous one.
    async fn upsert_reaction(&self, message: &MessageId, user: &UserId, emoji: &str)
    -> Result<()>;

    /// Remove `user`'s reaction. Returns whether one existed.
    async fn delete_reaction(&self, message: &MessageId, user: &UserId) -> Result<bool>;

    /// Current reactions on a message.
    async fn reactions(&self, message: &MessageId) -> Result<BTreeMap<UserId, String>>;

    /// Mark messages of `conversation` read by `user`. Messages from other
    /// conversations, the reader's own messages, and already-read messages
    /// are skipped. Returns the ids that gained a marker.
    async fn mark_read(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        message_ids: &[MessageId],
    ) -> Result<Vec<MessageId>>;

    /// Messages in `conversation` not sent by `user`, not deleted, and not yet read by them.
    async fn unread_count(&self, conversation: &ConversationId, user: &UserId) -> Result<u64>;
}
