//! Wire events of the live channel.
//!
//! Every frame is a JSON object tagged by `type`. Inbound frames may carry
//! an `id`; the server answers those with an [`ServerEvent::Ack`]. Outbound
//! frames carry a `timestamp` next to the event fields.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parley_core::model::{Conversation, FriendResponse, Message, MessageKind, UserProfile};
use parley_core::{CallId, ChatError, ConversationId, ErrorBody, MessageId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::calls::CallAnswer;

// ── Inbound ─────────────────────────────────────────────────────────

/// An event sent by a client session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Subscribe this session to a conversation.
    JoinRoom { conversation_id: ConversationId },
    /// Unsubscribe this session from a conversation.
    LeaveRoom { conversation_id: ConversationId },
    /// Post a message.
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        #[serde(default, alias = "messageType")]
        kind: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
    },
    /// The user started typing.
    TypingStart { conversation_id: ConversationId },
    /// The user stopped typing.
    TypingStop { conversation_id: ConversationId },
    /// Set the user's reaction on a message.
    AddReaction { message_id: MessageId, emoji: String },
    /// Clear the user's reaction on a message.
    RemoveReaction { message_id: MessageId },
    /// Mark messages as read.
    MarkRead {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
    /// Send a friend request.
    FriendRequestSent {
        target_user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Answer a friend request from `target_user_id`.
    FriendRequestResponded {
        target_user_id: UserId,
        response: FriendResponse,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Invite participants to a call.
    CallInvite {
        conversation_id: ConversationId,
        call_id: CallId,
        invited_user_ids: Vec<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_type: Option<String>,
    },
    /// Answer a call invitation.
    CallResponse { call_id: CallId, response: CallAnswer },
    /// End a call.
    CallEnded {
        call_id: CallId,
        conversation_id: ConversationId,
    },
}

impl ClientEvent {
    /// Wire name of the event, used for metrics labels and spans.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::SendMessage { .. } => "send_message",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::AddReaction { .. } => "add_reaction",
            Self::RemoveReaction { .. } => "remove_reaction",
            Self::MarkRead { .. } => "mark_read",
            Self::FriendRequestSent { .. } => "friend_request_sent",
            Self::FriendRequestResponded { .. } => "friend_request_responded",
            Self::CallInvite { .. } => "call_invite",
            Self::CallResponse { .. } => "call_response",
            Self::CallEnded { .. } => "call_ended",
        }
    }
}

/// Parse one inbound text frame.
///
/// The request id is returned even when the event itself is malformed, so
/// the caller can still address its error ack.
pub fn parse_frame(text: &str) -> (Option<String>, Result<ClientEvent, ChatError>) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return (None, Err(ChatError::validation(format!("invalid JSON: {e}")))),
    };
    let request_id = match value.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    let event = serde_json::from_value(value)
        .map_err(|e| ChatError::validation(format!("invalid event: {e}")));
    (request_id, event)
}

// ── Outbound ────────────────────────────────────────────────────────

/// Whether a reaction was set or cleared.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    /// Reaction set or replaced.
    Add,
    /// Reaction cleared.
    Remove,
}

/// An event delivered to client sessions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// A message was posted.
    NewMessage {
        conversation_id: ConversationId,
        message: Message,
    },
    /// A message's content changed.
    MessageEdited {
        conversation_id: ConversationId,
        message: Message,
    },
    /// A message was soft-deleted.
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    /// Someone started typing.
    UserTyping {
        conversation_id: ConversationId,
        user_id: UserId,
        name: String,
    },
    /// Someone stopped typing, explicitly or by inactivity.
    UserStoppedTyping {
        conversation_id: ConversationId,
        user_id: UserId,
        name: String,
    },
    /// A reaction was set or cleared.
    MessageReaction {
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        emoji: Option<String>,
        action: ReactionAction,
    },
    /// Messages were newly read.
    MessagesRead {
        conversation_id: ConversationId,
        user_id: UserId,
        message_ids: Vec<MessageId>,
    },
    /// A friend request arrived.
    FriendRequestReceived {
        from: UserProfile,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// A sent friend request was answered.
    FriendRequestResponded {
        from: UserProfile,
        response: FriendResponse,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// A pending friend request to the recipient was withdrawn.
    FriendRequestCancelled { from: UserId },
    /// A friend ended the friendship.
    FriendRemoved { user_id: UserId },
    /// The recipient is invited to a call.
    VideoCallInvitation {
        call_id: CallId,
        conversation_id: ConversationId,
        call_type: String,
        invited_by: UserProfile,
        expires_at: DateTime<Utc>,
    },
    /// An invitee answered; `synthesized` is set when the deadline answered for them.
    VideoCallResponseReceived {
        call_id: CallId,
        conversation_id: ConversationId,
        responded_by: UserId,
        response: CallAnswer,
        synthesized: bool,
    },
    /// A call ended.
    VideoCallEndedNotification {
        call_id: CallId,
        conversation_id: ConversationId,
        ended_by: UserId,
    },
    /// Snapshot of users with at least one live session.
    OnlineUsers { users: Vec<UserProfile> },
    /// A friend came online.
    FriendOnline { user_id: UserId, name: String },
    /// A friend went offline.
    FriendOffline {
        user_id: UserId,
        name: String,
        last_seen: DateTime<Utc>,
    },
    /// Another session subscribed to the conversation.
    UserJoinedRoom {
        conversation_id: ConversationId,
        user_id: UserId,
        name: String,
    },
    /// Another session unsubscribed from the conversation.
    UserLeftRoom {
        conversation_id: ConversationId,
        user_id: UserId,
        name: String,
    },
    /// Membership or metadata of a conversation changed.
    ConversationUpdated { conversation: Conversation },
    /// Reply to an inbound frame that carried an `id`.
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(flatten)]
    event: &'a ServerEvent,
    timestamp: String,
}

impl ServerEvent {
    /// Successful ack.
    pub fn ack_ok(request_id: Option<String>, result: Value) -> Self {
        Self::Ack {
            request_id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Failed ack.
    pub fn ack_err(request_id: Option<String>, error: &ChatError) -> Self {
        Self::Ack {
            request_id,
            success: false,
            result: None,
            error: Some(error.to_error_body()),
        }
    }

    /// Wire name of the event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
            Self::MessageEdited { .. } => "message_edited",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::UserTyping { .. } => "user_typing",
            Self::UserStoppedTyping { .. } => "user_stopped_typing",
            Self::MessageReaction { .. } => "message_reaction",
            Self::MessagesRead { .. } => "messages_read",
            Self::FriendRequestReceived { .. } => "friend_request_received",
            Self::FriendRequestResponded { .. } => "friend_request_responded",
            Self::FriendRequestCancelled { .. } => "friend_request_cancelled",
            Self::FriendRemoved { .. } => "friend_removed",
            Self::VideoCallInvitation { .. } => "video_call_invitation",
            Self::VideoCallResponseReceived { .. } => "video_call_response_received",
            Self::VideoCallEndedNotification { .. } => "video_call_ended_notification",
            Self::OnlineUsers { .. } => "online_users",
            Self::FriendOnline { .. } => "friend_online",
            Self::FriendOffline { .. } => "friend_offline",
            Self::UserJoinedRoom { .. } => "user_joined_room",
            Self::UserLeftRoom { .. } => "user_left_room",
            Self::ConversationUpdated { .. } => "conversation_updated",
            Self::Ack { .. } => "ack",
        }
    }

    /// Serialize once for delivery to any number of sessions.
    pub fn to_frame(&self) -> Result<Arc<String>, serde_json::Error> {
        let envelope = Envelope {
            event: self,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        serde_json::to_string(&envelope).map(Arc::new)
    }
}
