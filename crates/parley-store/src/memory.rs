//! In-process store.
//!
//! A single `RwLock` guards all tables, so every trait method is atomic.
//! Used by tests and by `parleyd` when no database path is configured.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use parley_core::constants::DELETED_MESSAGE_TEXT;
use parley_core::model::{
    Conversation, ConversationKind, FriendRequest, FriendResponse, Membership, Message,
    MessagePage, NewGroup, NewMessage, PageCursor, Presence, ReadMarker, Role, UserProfile,
};
use parley_core::{ConversationId, MessageId, UserId};

use crate::errors::{Result, StoreError};
use crate::paging;
use crate::traits::ChatStore;

struct UserRecord {
    profile: UserProfile,
    is_online: bool,
    last_seen: Option<DateTime<Utc>>,
    friends: BTreeSet<UserId>,
}

struct ConversationRecord {
    conversation: Conversation,
    next_seq: u64,
    messages: Vec<MessageId>,
}

#[derive(Default)]
struct Tables {
    users: HashMap<UserId, UserRecord>,
    friend_requests: Vec<FriendRequest>,
    conversations: HashMap<ConversationId, ConversationRecord>,
    direct_index: HashMap<(UserId, UserId), ConversationId>,
    messages: HashMap<MessageId, Message>,
}

impl Tables {
    fn user_mut(&mut self, id: &UserId) -> Result<&mut UserRecord> {
        self.users
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("user", id))
    }

    fn require_user(&self, id: &UserId) -> Result<()> {
        if self.users.contains_key(id) {
            Ok(())
        } else {
            Err(StoreError::not_found("user", id))
        }
    }

    fn conversation_mut(&mut self, id: &ConversationId) -> Result<&mut ConversationRecord> {
        self.conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("conversation", id))
    }

    fn message_mut(&mut self, id: &MessageId) -> Result<&mut Message> {
        self.messages
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("message", id))
    }

    fn request_index(&self, from: &UserId, to: &UserId) -> Option<usize> {
        self.friend_requests
            .iter()
            .position(|r| &r.from == from && &r.to == to)
    }
}

fn direct_key(a: &UserId, b: &UserId) -> (UserId, UserId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// In-memory [`ChatStore`].
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while set, every call fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_user(&self, name: &str, avatar: Option<&str>) -> Result<UserProfile> {
        self.check()?;
        let profile = UserProfile {
            id: UserId::new(),
            name: name.to_owned(),
            avatar: avatar.map(str::to_owned),
        };
        let _ = self.tables.write().users.insert(
            profile.id.clone(),
            UserRecord {
                profile: profile.clone(),
                is_online: false,
                last_seen: None,
                friends: BTreeSet::new(),
            },
        );
        Ok(profile)
    }

    async fn user(&self, id: &UserId) -> Result<Option<UserProfile>> {
        self.check()?;
        Ok(self.tables.read().users.get(id).map(|u| u.profile.clone()))
    }

    async fn users(&self, ids: &[UserId]) -> Result<Vec<UserProfile>> {
        self.check()?;
        let tables = self.tables.read();
        Ok(ids
            .iter()
            .filter_map(|id| tables.users.get(id).map(|u| u.profile.clone()))
            .collect())
    }

    async fn set_presence(&self, user: &UserId, online: bool, at: DateTime<Utc>) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.write();
        let record = tables.user_mut(user)?;
        record.is_online = online;
        if !online {
            record.last_seen = Some(at);
        }
        Ok(())
    }

    async fn presence(&self, user: &UserId) -> Result<Presence> {
        self.check()?;
        let tables = self.tables.read();
        let record = tables
            .users
            .get(user)
            .ok_or_else(|| StoreError::not_found("user", user))?;
        Ok(Presence {
            user_id: user.clone(),
            is_online: record.is_online,
            last_seen: record.last_seen,
        })
    }

    async fn friend_ids(&self, user: &UserId) -> Result<Vec<UserId>> {
        self.check()?;
        let tables = self.tables.read();
        Ok(tables
            .users
            .get(user)
            .map(|u| u.friends.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn send_friend_request(&self, from: &UserId, to: &UserId) -> Result<FriendRequest> {
        self.check()?;
        if from == to {
            return Err(StoreError::Conflict(
                "cannot send a friend request to yourself".into(),
            ));
        }
        let mut tables = self.tables.write();
        tables.require_user(to)?;
        let sender = tables.user_mut(from)?;
        if sender.friends.contains(to) {
            return Err(StoreError::Conflict("already friends".into()));
        }
        if tables.request_index(from, to).is_some() {
            return Err(StoreError::Conflict("friend request already sent".into()));
        }
        if tables.request_index(to, from).is_some() {
            return Err(StoreError::Conflict(
                "this user has already sent you a friend request".into(),
            ));
        }
        let request = FriendRequest {
            from: from.clone(),
            to: to.clone(),
            sent_at: Utc::now(),
        };
        tables.friend_requests.push(request.clone());
        Ok(request)
    }

    async fn respond_friend_request(
        &self,
        responder: &UserId,
        requester: &UserId,
        response: FriendResponse,
    ) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.write();
        let index = tables
            .request_index(requester, responder)
            .ok_or_else(|| StoreError::not_found("friend request", requester))?;
        let _ = tables.friend_requests.remove(index);
        if response == FriendResponse::Accepted {
            let _ = tables.user_mut(responder)?.friends.insert(requester.clone());
            let _ = tables.user_mut(requester)?.friends.insert(responder.clone());
        }
        Ok(())
    }

    async fn cancel_friend_request(&self, from: &UserId, to: &UserId) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.write();
        let index = tables
            .request_index(from, to)
            .ok_or_else(|| StoreError::not_found("friend request", to))?;
        let _ = tables.friend_requests.remove(index);
        Ok(())
    }

    async fn remove_friend(&self, user: &UserId, friend: &UserId) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.write();
        if !tables.user_mut(user)?.friends.remove(friend) {
            return Err(StoreError::not_found("friend", friend));
        }
        let _ = tables.user_mut(friend)?.friends.remove(user);
        Ok(())
    }

    async fn pending_friend_requests(&self, user: &UserId) -> Result<Vec<FriendRequest>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .friend_requests
            .iter()
            .filter(|r| &r.to == user)
            .cloned()
            .collect())
    }

    async fn conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .conversations
            .get(id)
            .map(|c| c.conversation.clone()))
    }

    async fn conversation_members(&self, id: &ConversationId) -> Result<Vec<Membership>> {
        self.check()?;
        self.tables
            .read()
            .conversations
            .get(id)
            .map(|c| c.conversation.members.clone())
            .ok_or_else(|| StoreError::not_found("conversation", id))
    }

    async fn membership(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<Option<Membership>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .conversations
            .get(conversation)
            .and_then(|c| c.conversation.member(user).cloned()))
    }

    async fn conversations_for_user(&self, user: &UserId) -> Result<Vec<Conversation>> {
        self.check()?;
        let tables = self.tables.read();
        let mut list: Vec<Conversation> = tables
            .conversations
            .values()
            .filter(|c| c.conversation.is_member(user))
            .map(|c| c.conversation.clone())
            .collect();
        list.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(list)
    }

    async fn create_direct_conversation(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> Result<(Conversation, bool)> {
        self.check()?;
        let mut tables = self.tables.write();
        tables.require_user(a)?;
        tables.require_user(b)?;
        let key = direct_key(a, b);
        if let Some(existing) = tables
            .direct_index
            .get(&key)
            .and_then(|id| tables.conversations.get(id))
        {
            return Ok((existing.conversation.clone(), false));
        }
        let now = Utc::now();
        let id = ConversationId::new();
        let member = |user: &UserId| Membership {
            conversation_id: id.clone(),
            user_id: user.clone(),
            role: Role::Member,
            joined_at: now,
        };
        let conversation = Conversation {
            id: id.clone(),
            kind: ConversationKind::Direct,
            name: None,
            description: None,
            created_by: a.clone(),
            members: vec![member(a), member(b)],
            allow_invites: false,
            created_at: now,
            last_activity: now,
        };
        let _ = tables.direct_index.insert(key, id.clone());
        let _ = tables.conversations.insert(
            id,
            ConversationRecord {
                conversation: conversation.clone(),
                next_seq: 0,
                messages: Vec::new(),
            },
        );
        Ok((conversation, true))
    }

    async fn create_group_conversation(&self, group: NewGroup) -> Result<Conversation> {
        self.check()?;
        let mut tables = self.tables.write();
        tables.require_user(&group.owner)?;
        for member in &group.members {
            tables.require_user(member)?;
        }
        let now = Utc::now();
        let id = ConversationId::new();
        let mut members = vec![Membership {
            conversation_id: id.clone(),
            user_id: group.owner.clone(),
            role: Role::Owner,
            joined_at: now,
        }];
        for user in group.members.iter().filter(|u| **u != group.owner) {
            if members.iter().all(|m| &m.user_id != user) {
                members.push(Membership {
                    conversation_id: id.clone(),
                    user_id: user.clone(),
                    role: Role::Member,
                    joined_at: now,
                });
            }
        }
        let conversation = Conversation {
            id: id.clone(),
            kind: ConversationKind::Group,
            name: Some(group.name),
            description: group.description,
            created_by: group.owner,
            members,
            allow_invites: group.allow_invites,
            created_at: now,
            last_activity: now,
        };
        let _ = tables.conversations.insert(
            id,
            ConversationRecord {
                conversation: conversation.clone(),
                next_seq: 0,
                messages: Vec::new(),
            },
        );
        Ok(conversation)
    }

    async fn add_member(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        role: Role,
    ) -> Result<Membership> {
        self.check()?;
        let mut tables = self.tables.write();
        tables.require_user(user)?;
        let record = tables.conversation_mut(conversation)?;
        if record.conversation.is_member(user) {
            return Err(StoreError::Conflict(
                "user is already a participant".into(),
            ));
        }
        let membership = Membership {
            conversation_id: conversation.clone(),
            user_id: user.clone(),
            role,
            joined_at: Utc::now(),
        };
        record.conversation.members.push(membership.clone());
        Ok(membership)
    }

    async fn remove_member(&self, conversation: &ConversationId, user: &UserId) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.write();
        let record = tables.conversation_mut(conversation)?;
        let before = record.conversation.members.len();
        record.conversation.members.retain(|m| &m.user_id != user);
        if record.conversation.members.len() == before {
            return Err(StoreError::not_found("membership", user));
        }
        Ok(())
    }

    async fn update_role(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        role: Role,
    ) -> Result<Membership> {
        self.check()?;
        let mut tables = self.tables.write();
        let record = tables.conversation_mut(conversation)?;
        let membership = record
            .conversation
            .members
            .iter_mut()
            .find(|m| &m.user_id == user)
            .ok_or_else(|| StoreError::not_found("membership", user))?;
        membership.role = role;
        Ok(membership.clone())
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message> {
        self.check()?;
        let mut tables = self.tables.write();
        let now = Utc::now();
        let record = tables.conversation_mut(&message.conversation_id)?;
        record.next_seq += 1;
        record.conversation.last_activity = now;
        let stored = Message {
            id: MessageId::new(),
            conversation_id: message.conversation_id,
            seq: record.next_seq,
            sender_id: message.sender_id,
            kind: message.kind,
            content: message.content,
            reply_to: message.reply_to,
            reactions: BTreeMap::new(),
            read_by: Vec::new(),
            edited_at: None,
            deleted: false,
            created_at: now,
        };
        record.messages.push(stored.id.clone());
        let _ = tables.messages.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn message(&self, id: &MessageId) -> Result<Option<Message>> {
        self.check()?;
        Ok(self.tables.read().messages.get(id).cloned())
    }

    async fn messages_page(
        &self,
        conversation: &ConversationId,
        cursor: PageCursor,
        limit: usize,
    ) -> Result<MessagePage> {
        self.check()?;
        let tables = self.tables.read();
        let record = tables
            .conversations
            .get(conversation)
            .ok_or_else(|| StoreError::not_found("conversation", conversation))?;
        let all = record
            .messages
            .iter()
            .filter_map(|id| tables.messages.get(id));

        let (messages, has_more) = match cursor {
            PageCursor::After(after) => {
                let mut newer: Vec<Message> =
                    all.filter(|m| m.seq > after).take(limit + 1).cloned().collect();
                let has_more = newer.len() > limit;
                newer.truncate(limit);
                (newer, has_more)
            }
            PageCursor::Latest | PageCursor::Before(_) => {
                let bound = match cursor {
                    PageCursor::Before(before) => before,
                    _ => u64::MAX,
                };
                let mut older: Vec<Message> = all
                    .rev()
                    .filter(|m| m.seq < bound)
                    .take(limit + 1)
                    .cloned()
                    .collect();
                let has_more = older.len() > limit;
                older.truncate(limit);
                older.reverse();
                (older, has_more)
            }
        };
        Ok(paging::assemble(messages, has_more, cursor))
    }

    async fn edit_message(
        &self,
        id: &MessageId,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<Message> {
        self.check()?;
        let mut tables = self.tables.write();
        let message = tables.message_mut(id)?;
        message.content = content.to_owned();
        message.edited_at = Some(at);
        Ok(message.clone())
    }

    async fn delete_message(&self, id: &MessageId, at: DateTime<Utc>) -> Result<Message> {
        self.check()?;
        let mut tables = self.tables.write();
        let message = tables.message_mut(id)?;
        message.deleted = true;
        message.content = DELETED_MESSAGE_TEXT.to_owned();
        message.edited_at = Some(at);
        Ok(message.clone())
    }

    async fn upsert_reaction(
        &self,
        message: &MessageId,
        user: &UserId,
        emoji: &str,
    ) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.write();
        let _ = tables
            .message_mut(message)?
            .reactions
            .insert(user.clone(), emoji.to_owned());
        Ok(())
    }

    async fn delete_reaction(&self, message: &MessageId, user: &UserId) -> Result<bool> {
        self.check()?;
        let mut tables = self.tables.write();
        Ok(tables.message_mut(message)?.reactions.remove(user).is_some())
    }

    async fn reactions(&self, message: &MessageId) -> Result<BTreeMap<UserId, String>> {
        self.check()?;
        self.tables
            .read()
            .messages
            .get(message)
            .map(|m| m.reactions.clone())
            .ok_or_else(|| StoreError::not_found("message", message))
    }

    async fn mark_read(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        message_ids: &[MessageId],
    ) -> Result<Vec<MessageId>> {
        self.check()?;
        let mut tables = self.tables.write();
        let now = Utc::now();
        let mut marked = Vec::new();
        for id in message_ids {
            let Some(message) = tables.messages.get_mut(id) else {
                continue;
            };
            if &message.conversation_id != conversation
                || message.sender_id.as_ref() == Some(user)
                || message.is_read_by(user)
            {
                continue;
            }
            message.read_by.push(ReadMarker {
                user_id: user.clone(),
                read_at: now,
            });
            marked.push(id.clone());
        }
        Ok(marked)
    }

    async fn unread_count(&self, conversation: &ConversationId, user: &UserId) -> Result<u64> {
        self.check()?;
        let tables = self.tables.read();
        let record = tables
            .conversations
            .get(conversation)
            .ok_or_else(|| StoreError::not_found("conversation", conversation))?;
        let count = record
            .messages
            .iter()
            .filter_map(|id| tables.messages.get(id))
            .filter(|m| m.sender_id.as_ref() != Some(user) && !m.deleted && !m.is_read_by(user))
            .count();
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parley_core::model::MessageKind;

    async fn seeded() -> (MemoryStore, UserProfile, UserProfile, ConversationId) {
        let store = MemoryStore::new();
        let alice = store.create_user("Alice", None).await.unwrap();
        let bob = store.create_user("Bob", None).await.unwrap();
        let (conv, _) = store
            .create_direct_conversation(&alice.id, &bob.id)
            .await
            .unwrap();
        (store, alice, bob, conv.id)
    }

    fn text(conv: &ConversationId, sender: &UserId, content: &str) -> NewMessage {
        NewMessage {
            conversation_id: conv.clone(),
            sender_id: Some(sender.clone()),
            kind: MessageKind::Text,
            content: content.into(),
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn seq_is_monotonic_per_conversation() {
        let (store, alice, bob, conv) = seeded().await;
        let m1 = store.create_message(text(&conv, &alice.id, "one")).await.unwrap();
        let m2 = store.create_message(text(&conv, &bob.id, "two")).await.unwrap();
        assert_eq!(m1.seq, 1);
        assert_eq!(m2.seq, 2);
    }

    #[tokio::test]
    async fn unavailable_store_rejects_writes() {
        let (store, alice, _, conv) = seeded().await;
        store.set_unavailable(true);
        let err = store
            .create_message(text(&conv, &alice.id, "lost"))
            .await
            .unwrap_err();
        assert_matches!(err, StoreError::Unavailable(_));
        store.set_unavailable(false);
        let page = store
            .messages_page(&conv, PageCursor::Latest, 50)
            .await
            .unwrap();
        assert!(page.messages.is_empty());
    }

    #[tokio::test]
    async fn direct_conversation_is_reused_in_either_order() {
        let (store, alice, bob, conv) = seeded().await;
        let (again, created) = store
            .create_direct_conversation(&bob.id, &alice.id)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(again.id, conv);
    }
}
