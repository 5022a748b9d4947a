//! Event router.
//!
//! Every operation runs the same pipeline whether it came from a live
//! session or the REST fallback: validate, authorize against the store,
//! write, then fan out to the subscribed sessions. Writes and their
//! fan-out run under the conversation's gate, so every recipient sees a
//! conversation's events in commit order. A store failure aborts before
//! anything is sent; a failed delivery is logged and skipped.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use parley_core::model::{
    Conversation, ConversationKind, FriendRequest, FriendResponse, Membership, Message,
    MessageKind, MessagePage, NewGroup, NewMessage, PageCursor, Role, UserProfile,
};
use parley_core::{
    CallId, ChatError, ConversationId, MessageId, Result, SessionId, UserId, validation,
};
use parley_store::ChatStore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument};

use crate::calls::{CallAnswer, CallCoordinator, CallInvitation, CallState, Response};
use crate::engine::SyncConfig;
use crate::events::{ClientEvent, ReactionAction, ServerEvent};
use crate::fanout::{DeliveryReport, Exclude, Fanout};
use crate::gates::ConversationGates;
use crate::metrics::{EVENTS_RECEIVED_TOTAL, EVENTS_REJECTED_TOTAL, STORE_FAILURES_TOTAL};
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomIndex;
use crate::session::Session;
use crate::typing::{TypingChange, TypingTracker};

/// Who performs an operation, and through which session if any.
#[derive(Clone, Debug)]
pub struct Actor {
    /// Authenticated user.
    pub user: UserProfile,
    /// Originating live session; `None` for REST calls.
    pub session_id: Option<SessionId>,
}

impl Actor {
    /// Actor for an event received on a live session.
    pub fn live(session: &Session) -> Self {
        Self {
            user: session.user().clone(),
            session_id: Some(session.id().clone()),
        }
    }

    /// Actor for a REST request.
    pub fn rest(user: UserProfile) -> Self {
        Self {
            user,
            session_id: None,
        }
    }

    /// Shortcut for `self.user.id`.
    pub fn user_id(&self) -> &UserId {
        &self.user.id
    }

    fn origin(&self) -> Exclude<'_> {
        self.session_id
            .as_ref()
            .map_or(Exclude::Nobody, Exclude::Session)
    }
}

/// A message to post.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Draft {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Raw content; trimmed and checked before the write.
    pub content: String,
    /// Content kind. `system` is rejected.
    pub kind: MessageKind,
    /// Message being replied to, in the same conversation.
    pub reply_to: Option<MessageId>,
}

/// Parameters for a new group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDraft {
    /// Group name.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Initial members besides the creator. Each must be a friend of the creator.
    #[serde(default)]
    pub members: Vec<UserId>,
    /// Whether regular members may add others.
    #[serde(default = "allow_invites_default")]
    pub allow_invites: bool,
}

fn allow_invites_default() -> bool {
    true
}

/// Routes inbound events and REST calls through authorize → write → fan-out.
pub struct EventRouter {
    store: Arc<dyn ChatStore>,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomIndex>,
    typing: Arc<TypingTracker>,
    calls: Arc<CallCoordinator>,
    fanout: Fanout,
    gates: ConversationGates,
    max_content_length: usize,
}

impl EventRouter {
    /// Build a router over shared engine state.
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomIndex>,
        config: &SyncConfig,
    ) -> Self {
        let fanout = Fanout::new(Arc::clone(&registry));
        Self {
            typing: TypingTracker::new(config.typing_window),
            calls: CallCoordinator::new(config.call_response_window, fanout.clone()),
            store,
            registry,
            rooms,
            fanout,
            gates: ConversationGates::new(),
            max_content_length: config.max_content_length,
        }
    }

    /// Typing state.
    pub fn typing(&self) -> &Arc<TypingTracker> {
        &self.typing
    }

    /// Call state.
    pub fn calls(&self) -> &Arc<CallCoordinator> {
        &self.calls
    }

    /// Delivery helper shared with the engine.
    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    // ── Live dispatch ───────────────────────────────────────────────

    /// Handle one inbound event. The returned value becomes the ack result.
    #[instrument(
        skip(self, actor, event),
        fields(kind = event.kind(), user_id = %actor.user.id, session_id = tracing::field::Empty)
    )]
    pub async fn dispatch(&self, actor: &Actor, event: ClientEvent) -> Result<Value> {
        if let Some(session_id) = &actor.session_id {
            let _ = tracing::Span::current()
                .record("session_id", tracing::field::display(session_id));
        }
        let kind = event.kind();
        counter!(EVENTS_RECEIVED_TOTAL, "kind" => kind).increment(1);
        let result = self.route(actor, event).await;
        if let Err(e) = &result {
            counter!(EVENTS_REJECTED_TOTAL, "kind" => kind, "code" => e.code()).increment(1);
            report_failure(kind, e);
        }
        result
    }

    async fn route(&self, actor: &Actor, event: ClientEvent) -> Result<Value> {
        match event {
            ClientEvent::JoinRoom { conversation_id } => {
                let subscribed = self.join_room(actor, &conversation_id).await?;
                Ok(json!({ "subscribed": subscribed }))
            }
            ClientEvent::LeaveRoom { conversation_id } => {
                let unsubscribed = self.leave_room(actor, &conversation_id)?;
                Ok(json!({ "unsubscribed": unsubscribed }))
            }
            ClientEvent::SendMessage {
                conversation_id,
                content,
                kind,
                reply_to,
            } => {
                let draft = Draft {
                    conversation_id,
                    content,
                    kind,
                    reply_to,
                };
                to_json(&self.send_message(actor, draft).await?)
            }
            ClientEvent::TypingStart { conversation_id } => {
                self.start_typing(actor, &conversation_id).await?;
                Ok(Value::Null)
            }
            ClientEvent::TypingStop { conversation_id } => {
                let _ = self.stop_typing(actor, &conversation_id);
                Ok(Value::Null)
            }
            ClientEvent::AddReaction { message_id, emoji } => {
                self.add_reaction(actor, &message_id, &emoji).await?;
                Ok(Value::Null)
            }
            ClientEvent::RemoveReaction { message_id } => {
                let removed = self.remove_reaction(actor, &message_id).await?;
                Ok(json!({ "removed": removed }))
            }
            ClientEvent::MarkRead {
                conversation_id,
                message_ids,
            } => {
                let marked = self.mark_read(actor, &conversation_id, &message_ids).await?;
                Ok(json!({ "messageIds": marked }))
            }
            ClientEvent::FriendRequestSent {
                target_user_id,
                payload,
            } => to_json(
                &self
                    .send_friend_request(actor, &target_user_id, payload)
                    .await?,
            ),
            ClientEvent::FriendRequestResponded {
                target_user_id,
                response,
                payload,
            } => {
                self.respond_friend_request(actor, &target_user_id, response, payload)
                    .await?;
                Ok(Value::Null)
            }
            ClientEvent::CallInvite {
                conversation_id,
                call_id,
                invited_user_ids,
                call_type,
            } => to_json(
                &self
                    .invite_to_call(actor, &conversation_id, call_id, &invited_user_ids, call_type)
                    .await?,
            ),
            ClientEvent::CallResponse { call_id, response } => {
                let state = self.respond_to_call(actor, &call_id, response)?;
                Ok(json!({ "state": state }))
            }
            ClientEvent::CallEnded {
                call_id,
                conversation_id,
            } => {
                self.end_call(actor, &call_id, &conversation_id).await?;
                Ok(Value::Null)
            }
        }
    }

    // ── Rooms ───────────────────────────────────────────────────────

    /// Subscribe a session to a conversation its user participates in.
    /// Returns `false` if it already was, or if the session is gone.
    ///
    /// The membership check and the insert share the conversation's gate
    /// with membership removal, so a removed user is never left subscribed.
    pub async fn subscribe(&self, session_id: &SessionId, conversation: &ConversationId) -> Result<bool> {
        let session = self
            .registry
            .session(session_id)
            .ok_or_else(|| ChatError::not_found("session", session_id))?;
        self.gates
            .run(conversation, async {
                let _ = self.require_member(session.user_id(), conversation).await?;
                Ok::<_, ChatError>(self.subscribe_checked(session_id, conversation))
            })
            .await
    }

    /// Explicit `join_room` from a live session.
    pub async fn join_room(&self, actor: &Actor, conversation: &ConversationId) -> Result<bool> {
        let session_id = require_session(actor)?;
        let joined = self.subscribe(session_id, conversation).await?;
        if joined {
            let event = ServerEvent::UserJoinedRoom {
                conversation_id: conversation.clone(),
                user_id: actor.user_id().clone(),
                name: actor.user.name.clone(),
            };
            let _ = self.broadcast(conversation, &event, Exclude::Session(session_id));
        }
        Ok(joined)
    }

    /// Explicit `leave_room` from a live session.
    pub fn leave_room(&self, actor: &Actor, conversation: &ConversationId) -> Result<bool> {
        let session_id = require_session(actor)?;
        let left = self.rooms.unsubscribe(session_id, conversation);
        if left {
            let event = ServerEvent::UserLeftRoom {
                conversation_id: conversation.clone(),
                user_id: actor.user_id().clone(),
                name: actor.user.name.clone(),
            };
            let _ = self.broadcast(conversation, &event, Exclude::Nobody);
        }
        Ok(left)
    }

    // ── Messages ────────────────────────────────────────────────────

    /// Post a message and deliver it to every subscribed session, the
    /// sender's included.
    pub async fn send_message(&self, actor: &Actor, draft: Draft) -> Result<Message> {
        let content = validation::message_content(&draft.content, draft.kind, self.max_content_length)?;
        let conversation = draft.conversation_id;
        let new = NewMessage {
            conversation_id: conversation.clone(),
            sender_id: Some(actor.user_id().clone()),
            kind: draft.kind,
            content,
            reply_to: draft.reply_to,
        };
        let message = self
            .gates
            .run(&conversation, async {
                let _ = self.require_member(actor.user_id(), &conversation).await?;
                if let Some(reply_to) = &new.reply_to {
                    let target = self.require_message(reply_to).await?;
                    if target.conversation_id != conversation {
                        return Err(ChatError::validation(
                            "reply target belongs to another conversation",
                        ));
                    }
                }
                let message = self.store.create_message(new).await?;
                let event = ServerEvent::NewMessage {
                    conversation_id: conversation.clone(),
                    message: message.clone(),
                };
                let _ = self.broadcast(&conversation, &event, Exclude::Nobody);
                Ok::<_, ChatError>(message)
            })
            .await?;
        debug!(message_id = %message.id, seq = message.seq, conversation_id = %conversation, "message sent");

        // Sending ends the sender's typing state.
        if self.typing.stop(&conversation, actor.user_id()) {
            self.broadcast_stopped_typing(&conversation, &actor.user);
        }
        Ok(message)
    }

    /// Replace the content of one's own text message.
    pub async fn edit_message(&self, actor: &Actor, id: &MessageId, content: &str) -> Result<Message> {
        let content = validation::message_content(content, MessageKind::Text, self.max_content_length)?;
        let conversation = self.require_message(id).await?.conversation_id;
        self.gates
            .run(&conversation, async {
                let _ = self.require_member(actor.user_id(), &conversation).await?;
                let message = self.require_message(id).await?;
                if message.sender_id.as_ref() != Some(actor.user_id()) {
                    return Err(ChatError::unauthorized("only the sender can edit a message"));
                }
                if message.deleted {
                    return Err(ChatError::validation("cannot edit a deleted message"));
                }
                if message.kind != MessageKind::Text {
                    return Err(ChatError::validation("only text messages can be edited"));
                }
                let edited = self.store.edit_message(id, &content, Utc::now()).await?;
                let event = ServerEvent::MessageEdited {
                    conversation_id: conversation.clone(),
                    message: edited.clone(),
                };
                let _ = self.broadcast(&conversation, &event, Exclude::Nobody);
                Ok::<_, ChatError>(edited)
            })
            .await
    }

    /// Soft-delete one's own message.
    pub async fn delete_message(&self, actor: &Actor, id: &MessageId) -> Result<Message> {
        let conversation = self.require_message(id).await?.conversation_id;
        self.gates
            .run(&conversation, async {
                let _ = self.require_member(actor.user_id(), &conversation).await?;
                let message = self.require_message(id).await?;
                if message.sender_id.as_ref() != Some(actor.user_id()) {
                    return Err(ChatError::unauthorized("only the sender can delete a message"));
                }
                if message.deleted {
                    return Err(ChatError::validation("message already deleted"));
                }
                let deleted = self.store.delete_message(id, Utc::now()).await?;
                let event = ServerEvent::MessageDeleted {
                    conversation_id: conversation.clone(),
                    message_id: id.clone(),
                };
                let _ = self.broadcast(&conversation, &event, Exclude::Nobody);
                Ok::<_, ChatError>(deleted)
            })
            .await
    }

    /// A page of history.
    pub async fn messages_page(
        &self,
        actor: &Actor,
        conversation: &ConversationId,
        cursor: PageCursor,
        limit: Option<usize>,
    ) -> Result<MessagePage> {
        let _ = self.require_member(actor.user_id(), conversation).await?;
        let page = self
            .store
            .messages_page(conversation, cursor, validation::page_limit(limit))
            .await?;
        Ok(page)
    }

    /// Messages in `conversation` the actor has not read.
    pub async fn unread_count(&self, actor: &Actor, conversation: &ConversationId) -> Result<u64> {
        let _ = self.require_member(actor.user_id(), conversation).await?;
        Ok(self.store.unread_count(conversation, actor.user_id()).await?)
    }

    // ── Typing ──────────────────────────────────────────────────────

    /// Typing signal. Observers hear only the idle → typing transition;
    /// renewals just push the expiry out.
    pub async fn start_typing(&self, actor: &Actor, conversation: &ConversationId) -> Result<()> {
        self.authorize_cached(actor, conversation).await?;
        let rooms = Arc::clone(&self.rooms);
        let fanout = self.fanout.clone();
        let conv = conversation.clone();
        let user = actor.user.clone();
        let change = self
            .typing
            .start(conversation, actor.user_id(), move || async move {
                let event = ServerEvent::UserStoppedTyping {
                    conversation_id: conv.clone(),
                    user_id: user.id.clone(),
                    name: user.name.clone(),
                };
                let members = rooms.members_of(&conv);
                let _ = fanout.to_sessions(&members, &event, Exclude::User(&user.id));
            });
        if change == TypingChange::Started {
            let event = ServerEvent::UserTyping {
                conversation_id: conversation.clone(),
                user_id: actor.user_id().clone(),
                name: actor.user.name.clone(),
            };
            let _ = self.broadcast(conversation, &event, Exclude::User(actor.user_id()));
        }
        Ok(())
    }

    /// Explicit typing stop. Returns whether the user was typing.
    pub fn stop_typing(&self, actor: &Actor, conversation: &ConversationId) -> bool {
        let was_typing = self.typing.stop(conversation, actor.user_id());
        if was_typing {
            self.broadcast_stopped_typing(conversation, &actor.user);
        }
        was_typing
    }

    /// Clear typing state of a user who went fully offline.
    pub(crate) fn clear_typing(&self, user: &UserProfile) {
        for conversation in self.typing.clear_user(&user.id) {
            self.broadcast_stopped_typing(&conversation, user);
        }
    }

    fn broadcast_stopped_typing(&self, conversation: &ConversationId, user: &UserProfile) {
        let event = ServerEvent::UserStoppedTyping {
            conversation_id: conversation.clone(),
            user_id: user.id.clone(),
            name: user.name.clone(),
        };
        let _ = self.broadcast(conversation, &event, Exclude::User(&user.id));
    }

    // ── Reactions and receipts ──────────────────────────────────────

    /// Set the actor's reaction, replacing any earlier one.
    pub async fn add_reaction(&self, actor: &Actor, message_id: &MessageId, emoji: &str) -> Result<()> {
        let emoji = validation::emoji(emoji)?;
        let conversation = self.require_message(message_id).await?.conversation_id;
        self.gates
            .run(&conversation, async {
                let _ = self.require_member(actor.user_id(), &conversation).await?;
                if self.require_message(message_id).await?.deleted {
                    return Err(ChatError::validation("cannot react to a deleted message"));
                }
                self.store
                    .upsert_reaction(message_id, actor.user_id(), &emoji)
                    .await?;
                let event = ServerEvent::MessageReaction {
                    conversation_id: conversation.clone(),
                    message_id: message_id.clone(),
                    user_id: actor.user_id().clone(),
                    emoji: Some(emoji.clone()),
                    action: ReactionAction::Add,
                };
                let _ = self.broadcast(&conversation, &event, Exclude::Nobody);
                Ok::<_, ChatError>(())
            })
            .await
    }

    /// Clear the actor's reaction. Nothing is broadcast if there was none.
    pub async fn remove_reaction(&self, actor: &Actor, message_id: &MessageId) -> Result<bool> {
        let message = self.require_message(message_id).await?;
        let conversation = message.conversation_id;
        self.gates
            .run(&conversation, async {
                let _ = self.require_member(actor.user_id(), &conversation).await?;
                let removed = self.store.delete_reaction(message_id, actor.user_id()).await?;
                if removed {
                    let event = ServerEvent::MessageReaction {
                        conversation_id: conversation.clone(),
                        message_id: message_id.clone(),
                        user_id: actor.user_id().clone(),
                        emoji: None,
                        action: ReactionAction::Remove,
                    };
                    let _ = self.broadcast(&conversation, &event, Exclude::Nobody);
                }
                Ok::<_, ChatError>(removed)
            })
            .await
    }

    /// Mark messages read. Only newly marked ids are broadcast, and not back
    /// to the originating session; a repeat is a silent no-op.
    pub async fn mark_read(
        &self,
        actor: &Actor,
        conversation: &ConversationId,
        message_ids: &[MessageId],
    ) -> Result<Vec<MessageId>> {
        if message_ids.is_empty() {
            return Err(ChatError::validation("no message ids given"));
        }
        self.gates
            .run(conversation, async {
                let _ = self.require_member(actor.user_id(), conversation).await?;
                let marked = self
                    .store
                    .mark_read(conversation, actor.user_id(), message_ids)
                    .await?;
                if !marked.is_empty() {
                    let event = ServerEvent::MessagesRead {
                        conversation_id: conversation.clone(),
                        user_id: actor.user_id().clone(),
                        message_ids: marked.clone(),
                    };
                    let _ = self.broadcast(conversation, &event, actor.origin());
                }
                Ok::<_, ChatError>(marked)
            })
            .await
    }

    // ── Friends ─────────────────────────────────────────────────────

    /// Send a friend request and notify the addressee.
    pub async fn send_friend_request(
        &self,
        actor: &Actor,
        target: &UserId,
        payload: Option<Value>,
    ) -> Result<FriendRequest> {
        if target == actor.user_id() {
            return Err(ChatError::validation("cannot send a friend request to yourself"));
        }
        let request = self.store.send_friend_request(actor.user_id(), target).await?;
        let event = ServerEvent::FriendRequestReceived {
            from: actor.user.clone(),
            payload,
        };
        let _ = self.fanout.to_users(std::slice::from_ref(target), &event);
        Ok(request)
    }

    /// Answer a pending request from `requester` and notify them. On
    /// acceptance each side learns whether the other is online.
    pub async fn respond_friend_request(
        &self,
        actor: &Actor,
        requester: &UserId,
        response: FriendResponse,
        payload: Option<Value>,
    ) -> Result<()> {
        self.store
            .respond_friend_request(actor.user_id(), requester, response)
            .await?;
        let event = ServerEvent::FriendRequestResponded {
            from: actor.user.clone(),
            response,
            payload,
        };
        let _ = self.fanout.to_users(std::slice::from_ref(requester), &event);

        if response == FriendResponse::Accepted {
            if self.registry.is_online(actor.user_id()) {
                let online = ServerEvent::FriendOnline {
                    user_id: actor.user_id().clone(),
                    name: actor.user.name.clone(),
                };
                let _ = self.fanout.to_users(std::slice::from_ref(requester), &online);
            }
            if let Some(session) = self.registry.sessions_for(requester).first() {
                let online = ServerEvent::FriendOnline {
                    user_id: requester.clone(),
                    name: session.user().name.clone(),
                };
                let _ = self
                    .fanout
                    .to_users(std::slice::from_ref(actor.user_id()), &online);
            }
        }
        Ok(())
    }

    /// Withdraw a request the actor sent to `target`, who is told.
    pub async fn cancel_friend_request(&self, actor: &Actor, target: &UserId) -> Result<()> {
        self.store.cancel_friend_request(actor.user_id(), target).await?;
        let event = ServerEvent::FriendRequestCancelled {
            from: actor.user_id().clone(),
        };
        let _ = self.fanout.to_users(std::slice::from_ref(target), &event);
        Ok(())
    }

    /// End a friendship. Existing conversations are kept.
    pub async fn remove_friend(&self, actor: &Actor, friend: &UserId) -> Result<()> {
        if !self.store.are_friends(actor.user_id(), friend).await? {
            return Err(ChatError::validation(format!("user {friend} is not a friend")));
        }
        self.store.remove_friend(actor.user_id(), friend).await?;
        let event = ServerEvent::FriendRemoved {
            user_id: actor.user_id().clone(),
        };
        let _ = self.fanout.to_users(std::slice::from_ref(friend), &event);
        info!(user_id = %actor.user_id(), friend_id = %friend, "friend removed");
        Ok(())
    }

    /// Requests waiting for the actor's answer.
    pub async fn pending_friend_requests(&self, actor: &Actor) -> Result<Vec<FriendRequest>> {
        Ok(self.store.pending_friend_requests(actor.user_id()).await?)
    }

    /// Profiles of the actor's friends.
    pub async fn friends(&self, actor: &Actor) -> Result<Vec<UserProfile>> {
        let ids = self.store.friend_ids(actor.user_id()).await?;
        Ok(self.store.users(&ids).await?)
    }

    // ── Calls ───────────────────────────────────────────────────────

    /// Invite participants of a conversation to a call.
    pub async fn invite_to_call(
        &self,
        actor: &Actor,
        conversation: &ConversationId,
        call_id: CallId,
        invited: &[UserId],
        call_type: Option<String>,
    ) -> Result<CallInvitation> {
        let conv = self.require_conversation(conversation).await?;
        if !conv.is_member(actor.user_id()) {
            return Err(ChatError::unauthorized("not a participant of this conversation"));
        }
        if let Some(outsider) = invited.iter().find(|u| !conv.is_member(u)) {
            return Err(ChatError::validation(format!(
                "user {outsider} is not a participant of this conversation"
            )));
        }
        let invitation = self.calls.invite(
            call_id,
            conversation.clone(),
            actor.user.clone(),
            invited,
            call_type,
        )?;
        let event = ServerEvent::VideoCallInvitation {
            call_id: invitation.call_id.clone(),
            conversation_id: conversation.clone(),
            call_type: invitation.call_type.clone(),
            invited_by: actor.user.clone(),
            expires_at: invitation.deadline,
        };
        let _ = self.fanout.to_users(&invitation.invited, &event);
        Ok(invitation)
    }

    /// Answer a call. Only the deciding answer reaches the inviter.
    pub fn respond_to_call(&self, actor: &Actor, call_id: &CallId, answer: CallAnswer) -> Result<CallState> {
        match self.calls.respond(call_id, actor.user_id(), answer)? {
            Response::Decided(call) => {
                let event = ServerEvent::VideoCallResponseReceived {
                    call_id: call.call_id.clone(),
                    conversation_id: call.conversation_id.clone(),
                    responded_by: actor.user_id().clone(),
                    response: answer,
                    synthesized: false,
                };
                let _ = self
                    .fanout
                    .to_users(std::slice::from_ref(&call.inviter.id), &event);
                Ok(call.state)
            }
            Response::Ignored(call) => Ok(call.state),
        }
    }

    /// End a call and tell the conversation.
    pub async fn end_call(&self, actor: &Actor, call_id: &CallId, conversation: &ConversationId) -> Result<()> {
        let _ = self.require_member(actor.user_id(), conversation).await?;
        if let Some(call) = self.calls.get(call_id) {
            if &call.conversation_id != conversation {
                return Err(ChatError::validation("call belongs to another conversation"));
            }
        }
        let _ = self.calls.end(call_id);
        let event = ServerEvent::VideoCallEndedNotification {
            call_id: call_id.clone(),
            conversation_id: conversation.clone(),
            ended_by: actor.user_id().clone(),
        };
        let _ = self.broadcast(conversation, &event, Exclude::Nobody);
        Ok(())
    }

    // ── Conversations and membership ────────────────────────────────

    /// Conversations of the actor, most recently active first.
    pub async fn conversations(&self, actor: &Actor) -> Result<Vec<Conversation>> {
        Ok(self.store.conversations_for_user(actor.user_id()).await?)
    }

    /// Open (or return the existing) direct conversation with a friend.
    pub async fn open_direct_conversation(&self, actor: &Actor, peer: &UserId) -> Result<Conversation> {
        if peer == actor.user_id() {
            return Err(ChatError::validation("cannot open a conversation with yourself"));
        }
        let _ = self.require_user(peer).await?;
        if !self.store.are_friends(actor.user_id(), peer).await? {
            return Err(ChatError::unauthorized(
                "direct conversations are limited to friends",
            ));
        }
        let (conversation, created) = self
            .store
            .create_direct_conversation(actor.user_id(), peer)
            .await?;
        if created {
            let members = conversation.member_ids();
            self.subscribe_users(&conversation.id, &members);
            let event = ServerEvent::ConversationUpdated {
                conversation: conversation.clone(),
            };
            let _ = self.fanout.to_users(&members, &event);
            info!(conversation_id = %conversation.id, "direct conversation opened");
        }
        Ok(conversation)
    }

    /// Create a group owned by the actor.
    pub async fn create_group_conversation(&self, actor: &Actor, draft: GroupDraft) -> Result<Conversation> {
        let (name, description) = validation::group_details(&draft.name, draft.description.as_deref())?;
        let mut members: Vec<UserId> = draft
            .members
            .into_iter()
            .filter(|u| u != actor.user_id())
            .collect();
        members.sort();
        members.dedup();
        for member in &members {
            if !self.store.are_friends(actor.user_id(), member).await? {
                return Err(ChatError::unauthorized(format!(
                    "user {member} is not a friend"
                )));
            }
        }
        let conversation = self
            .store
            .create_group_conversation(NewGroup {
                name,
                description,
                owner: actor.user_id().clone(),
                members,
                allow_invites: draft.allow_invites,
            })
            .await?;
        let everyone = conversation.member_ids();
        self.subscribe_users(&conversation.id, &everyone);
        let text = format!("{} created the group", actor.user.name);
        let _ = self
            .gates
            .run(&conversation.id, self.post_system(&conversation.id, text))
            .await?;
        let event = ServerEvent::ConversationUpdated {
            conversation: conversation.clone(),
        };
        let _ = self.fanout.to_users(&everyone, &event);
        info!(conversation_id = %conversation.id, members = everyone.len(), "group created");
        Ok(conversation)
    }

    /// Add a friend of the actor to a group.
    pub async fn add_member(&self, actor: &Actor, conversation: &ConversationId, user: &UserId) -> Result<Membership> {
        let conv = self.require_conversation(conversation).await?;
        if conv.kind != ConversationKind::Group {
            return Err(ChatError::validation("members can only be added to groups"));
        }
        let role = conv
            .member(actor.user_id())
            .map(|m| m.role)
            .ok_or_else(|| ChatError::unauthorized("not a participant of this conversation"))?;
        if !conv.allow_invites && !role.can_manage() {
            return Err(ChatError::unauthorized("only admins can add members"));
        }
        let target = self.require_user(user).await?;
        if !self.store.are_friends(actor.user_id(), user).await? {
            return Err(ChatError::unauthorized(format!("user {user} is not a friend")));
        }

        let (membership, updated) = self
            .gates
            .run(conversation, async {
                let membership = self.store.add_member(conversation, user, Role::Member).await?;
                self.subscribe_users(conversation, std::slice::from_ref(user));
                let text = format!("{} added {}", actor.user.name, target.name);
                let _ = self.post_system(conversation, text).await?;
                let updated = self.require_conversation(conversation).await?;
                Ok::<_, ChatError>((membership, updated))
            })
            .await?;
        let event = ServerEvent::ConversationUpdated {
            conversation: updated.clone(),
        };
        let _ = self.fanout.to_users(&updated.member_ids(), &event);
        info!(conversation_id = %conversation, user_id = %user, "member added");
        Ok(membership)
    }

    /// Remove a member. Anyone may leave; admins and owners may remove
    /// anyone but the owner.
    pub async fn remove_member(&self, actor: &Actor, conversation: &ConversationId, user: &UserId) -> Result<()> {
        let conv = self.require_conversation(conversation).await?;
        if conv.kind != ConversationKind::Group {
            return Err(ChatError::validation("cannot leave a direct conversation"));
        }
        let actor_role = conv
            .member(actor.user_id())
            .map(|m| m.role)
            .ok_or_else(|| ChatError::unauthorized("not a participant of this conversation"))?;
        let target_role = conv
            .member(user)
            .map(|m| m.role)
            .ok_or_else(|| ChatError::not_found("membership", user))?;
        let leaving = user == actor.user_id();
        if !leaving && (!actor_role.can_manage() || target_role == Role::Owner) {
            return Err(ChatError::unauthorized("not allowed to remove this member"));
        }
        let target = self
            .require_user(user)
            .await
            .unwrap_or_else(|_| UserProfile {
                id: user.clone(),
                name: user.to_string(),
                avatar: None,
            });
        let target_name = target.name.clone();

        let updated = self
            .gates
            .run(conversation, async {
                self.store.remove_member(conversation, user).await?;
                self.unsubscribe_user(conversation, &target);
                let text = if leaving {
                    format!("{target_name} left the group")
                } else {
                    format!("{} removed {target_name}", actor.user.name)
                };
                let _ = self.post_system(conversation, text).await?;
                self.require_conversation(conversation).await
            })
            .await?;
        let event = ServerEvent::ConversationUpdated {
            conversation: updated.clone(),
        };
        let mut recipients = updated.member_ids();
        recipients.push(user.clone());
        let _ = self.fanout.to_users(&recipients, &event);
        info!(conversation_id = %conversation, user_id = %user, leaving, "member removed");
        Ok(())
    }

    /// Promote a member to admin or demote an admin. Owner only; the
    /// owner's own role never changes.
    pub async fn update_role(
        &self,
        actor: &Actor,
        conversation: &ConversationId,
        user: &UserId,
        role: Role,
    ) -> Result<Membership> {
        if role == Role::Owner {
            return Err(ChatError::validation("role must be member or admin"));
        }
        let conv = self.require_conversation(conversation).await?;
        if conv.kind != ConversationKind::Group {
            return Err(ChatError::validation("roles exist only in groups"));
        }
        if conv.member(actor.user_id()).map(|m| m.role) != Some(Role::Owner) {
            return Err(ChatError::unauthorized("only the owner can change roles"));
        }
        let target_role = conv
            .member(user)
            .map(|m| m.role)
            .ok_or_else(|| ChatError::not_found("membership", user))?;
        if target_role == Role::Owner {
            return Err(ChatError::validation("the owner's role cannot change"));
        }
        let target = self.require_user(user).await?;

        let (membership, updated) = self
            .gates
            .run(conversation, async {
                let membership = self.store.update_role(conversation, user, role).await?;
                let text = match role {
                    Role::Admin => format!("{} is now an admin", target.name),
                    _ => format!("{} is now a member", target.name),
                };
                let _ = self.post_system(conversation, text).await?;
                let updated = self.require_conversation(conversation).await?;
                Ok::<_, ChatError>((membership, updated))
            })
            .await?;
        let event = ServerEvent::ConversationUpdated {
            conversation: updated.clone(),
        };
        let _ = self.fanout.to_users(&updated.member_ids(), &event);
        info!(conversation_id = %conversation, user_id = %user, role = role.as_str(), "role updated");
        Ok(membership)
    }

    /// Subscribe every live session of each user.
    pub(crate) fn subscribe_users(&self, conversation: &ConversationId, users: &[UserId]) {
        for user in users {
            for session_id in self.registry.session_ids_for(user) {
                let _ = self.subscribe_checked(&session_id, conversation);
            }
        }
    }

    /// Drop every session of a removed user from the room. Remaining
    /// members hear that the user stopped typing if they were.
    fn unsubscribe_user(&self, conversation: &ConversationId, user: &UserProfile) {
        for session_id in self.registry.session_ids_for(&user.id) {
            let _ = self.rooms.unsubscribe(&session_id, conversation);
        }
        if self.typing.stop(conversation, &user.id) {
            debug!(conversation_id = %conversation, user_id = %user.id, "typing cleared on removal");
            self.broadcast_stopped_typing(conversation, user);
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// Insert into the room index, backing out if the session unregistered
    /// concurrently. Disconnect unregisters before clearing rooms, so one of
    /// the two always removes the entry.
    fn subscribe_checked(&self, session_id: &SessionId, conversation: &ConversationId) -> bool {
        let inserted = self.rooms.subscribe(session_id, conversation);
        if self.registry.session(session_id).is_none() {
            let _ = self.rooms.unsubscribe(session_id, conversation);
            return false;
        }
        inserted
    }

    fn broadcast(&self, conversation: &ConversationId, event: &ServerEvent, exclude: Exclude<'_>) -> DeliveryReport {
        let members = self.rooms.members_of(conversation);
        self.fanout.to_sessions(&members, event, exclude)
    }

    async fn post_system(&self, conversation: &ConversationId, text: String) -> Result<Message> {
        let message = self
            .store
            .create_message(NewMessage::system(conversation.clone(), text))
            .await?;
        let event = ServerEvent::NewMessage {
            conversation_id: conversation.clone(),
            message: message.clone(),
        };
        let _ = self.broadcast(conversation, &event, Exclude::Nobody);
        Ok(message)
    }

    async fn require_member(&self, user: &UserId, conversation: &ConversationId) -> Result<Membership> {
        if let Some(membership) = self.store.membership(conversation, user).await? {
            return Ok(membership);
        }
        if self.store.conversation(conversation).await?.is_some() {
            Err(ChatError::unauthorized("not a participant of this conversation"))
        } else {
            Err(ChatError::not_found("conversation", conversation))
        }
    }

    /// Subscribed sessions are known participants; anything else asks the store.
    async fn authorize_cached(&self, actor: &Actor, conversation: &ConversationId) -> Result<()> {
        if let Some(session_id) = &actor.session_id {
            if self.rooms.is_subscribed(session_id, conversation) {
                return Ok(());
            }
        }
        let _ = self.require_member(actor.user_id(), conversation).await?;
        Ok(())
    }

    async fn require_conversation(&self, id: &ConversationId) -> Result<Conversation> {
        self.store
            .conversation(id)
            .await?
            .ok_or_else(|| ChatError::not_found("conversation", id))
    }

    async fn require_message(&self, id: &MessageId) -> Result<Message> {
        self.store
            .message(id)
            .await?
            .ok_or_else(|| ChatError::not_found("message", id))
    }

    async fn require_user(&self, id: &UserId) -> Result<UserProfile> {
        self.store
            .user(id)
            .await?
            .ok_or_else(|| ChatError::not_found("user", id))
    }
}

fn require_session(actor: &Actor) -> Result<&SessionId> {
    actor
        .session_id
        .as_ref()
        .ok_or_else(|| ChatError::validation("this event needs a live session"))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| ChatError::validation(format!("unserializable result: {e}")))
}

fn report_failure(kind: &'static str, err: &ChatError) {
    match err {
        ChatError::StoreUnavailable { .. } => {
            counter!(STORE_FAILURES_TOTAL, "kind" => kind).increment(1);
            error!(event = kind, error = %err, "store failure");
        }
        _ => debug!(event = kind, code = err.code(), error = %err, "event rejected"),
    }
}
