//! Domain model shared by the store, the engine, and the wire.
//!
//! All types serialize with camelCase field names, which is what clients
//! see inside event payloads and REST responses.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId, UserId};

// ── Users and presence ──────────────────────────────────────────────

/// Public view of a user account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// Account identifier.
    pub id: UserId,
    /// Display name.
    pub name: String,
    /// Avatar URL, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Online status plus last-seen timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    /// Whose presence this is.
    pub user_id: UserId,
    /// Whether the user currently has a live session.
    pub is_online: bool,
    /// When the user's last session ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Who is online right now, plus the presence of one user's friends.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    /// Users with at least one live session.
    pub online: Vec<UserProfile>,
    /// Presence of each friend.
    pub friends: Vec<Presence>,
}

/// A pending friend request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequest {
    /// Requesting user.
    pub from: UserId,
    /// Addressee.
    pub to: UserId,
    /// When the request was sent.
    pub sent_at: DateTime<Utc>,
}

/// Answer to a friend request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendResponse {
    /// Both users become friends.
    Accepted,
    /// The request is discarded.
    Rejected,
}

// ── Conversations ───────────────────────────────────────────────────

/// Conversation shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    /// Exactly two participants.
    Direct,
    /// Named, any number of participants, role-based administration.
    Group,
}

impl ConversationKind {
    /// Storage/wire label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }

    /// Parse a storage label.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// Role of a participant inside a conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular participant.
    Member,
    /// May invite and remove members.
    Admin,
    /// Creator of a group; may also change roles.
    Owner,
}

impl Role {
    /// Whether this role may manage other members.
    pub fn can_manage(self) -> bool {
        matches!(self, Self::Admin | Self::Owner)
    }

    /// Storage/wire label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }

    /// Parse a storage label.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "member" => Some(Self::Member),
            "admin" => Some(Self::Admin),
            "owner" => Some(Self::Owner),
            _ => None,
        }
    }
}

/// A user's participation in a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    /// Conversation joined.
    pub conversation_id: ConversationId,
    /// Participant.
    pub user_id: UserId,
    /// Participant's role.
    pub role: Role,
    /// When the participant joined.
    pub joined_at: DateTime<Utc>,
}

/// A direct or group conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Conversation identifier.
    pub id: ConversationId,
    /// Direct or group.
    pub kind: ConversationKind,
    /// Group name. Always `None` for direct conversations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Group description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// User who created the conversation.
    pub created_by: UserId,
    /// Current participants.
    pub members: Vec<Membership>,
    /// Whether regular members may invite others into a group.
    pub allow_invites: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the most recent message.
    pub last_activity: DateTime<Utc>,
}

impl Conversation {
    /// Membership record for `user`, if they participate.
    pub fn member(&self, user: &UserId) -> Option<&Membership> {
        self.members.iter().find(|m| &m.user_id == user)
    }

    /// Whether `user` participates.
    pub fn is_member(&self, user: &UserId) -> bool {
        self.member(user).is_some()
    }

    /// Identifiers of all participants.
    pub fn member_ids(&self) -> Vec<UserId> {
        self.members.iter().map(|m| m.user_id.clone()).collect()
    }
}

/// Parameters for a new group conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGroup {
    /// Group name.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Creator; becomes owner.
    pub owner: UserId,
    /// Initial members besides the owner.
    pub members: Vec<UserId>,
    /// Whether regular members may invite.
    #[serde(default = "default_allow_invites")]
    pub allow_invites: bool,
}

fn default_allow_invites() -> bool {
    true
}

// ── Messages ────────────────────────────────────────────────────────

/// Message content kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text.
    #[default]
    Text,
    /// Image reference.
    Image,
    /// File reference.
    File,
    /// Engine-generated notice (member added, etc.).
    System,
    /// A bare emoji.
    Emoji,
}

impl MessageKind {
    /// Storage/wire label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::System => "system",
            Self::Emoji => "emoji",
        }
    }

    /// Parse a storage label.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            "system" => Some(Self::System),
            "emoji" => Some(Self::Emoji),
            _ => None,
        }
    }
}

/// A user's read receipt for one message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadMarker {
    /// Reader.
    pub user_id: UserId,
    /// When the message was read.
    pub read_at: DateTime<Utc>,
}

/// A persisted message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message identifier.
    pub id: MessageId,
    /// Conversation it belongs to.
    pub conversation_id: ConversationId,
    /// Per-conversation monotonic sequence number.
    pub seq: u64,
    /// Author; `None` for system messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    /// Content kind.
    pub kind: MessageKind,
    /// Body.
    pub content: String,
    /// Message this one replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    /// One reaction per user.
    #[serde(default)]
    pub reactions: BTreeMap<UserId, String>,
    /// Read receipts.
    #[serde(default)]
    pub read_by: Vec<ReadMarker>,
    /// Last edit time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    /// Soft-delete flag.
    #[serde(default)]
    pub deleted: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Whether `user` has a read marker on this message.
    pub fn is_read_by(&self, user: &UserId) -> bool {
        self.read_by.iter().any(|r| &r.user_id == user)
    }
}

/// Parameters for a message insert. The store assigns id, seq, and timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewMessage {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Author; `None` for system messages.
    pub sender_id: Option<UserId>,
    /// Content kind.
    pub kind: MessageKind,
    /// Validated body.
    pub content: String,
    /// Reply target, already checked to be in the same conversation.
    pub reply_to: Option<MessageId>,
}

impl NewMessage {
    /// A system notice authored by the engine.
    pub fn system(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            sender_id: None,
            kind: MessageKind::System,
            content: content.into(),
            reply_to: None,
        }
    }
}

/// Where a page of messages starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PageCursor {
    /// The newest messages.
    #[default]
    Latest,
    /// Messages with `seq` strictly below the value.
    Before(u64),
    /// Messages with `seq` strictly above the value.
    After(u64),
}

/// A page of messages, oldest first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    /// Messages in ascending `seq` order.
    pub messages: Vec<Message>,
    /// Whether more messages exist past this page in the cursor's direction.
    pub has_more: bool,
    /// Cursor value for the next page in the same direction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership(user: &str, role: Role) -> Membership {
        Membership {
            conversation_id: ConversationId::from("c1"),
            user_id: UserId::from(user),
            role,
            joined_at: Utc::now(),
        }
    }

    #[test]
    fn role_management_rights() {
        assert!(!Role::Member.can_manage());
        assert!(Role::Admin.can_manage());
        assert!(Role::Owner.can_manage());
    }

    #[test]
    fn labels_round_trip() {
        for kind in [
            MessageKind::Text,
            MessageKind::Image,
            MessageKind::File,
            MessageKind::System,
            MessageKind::Emoji,
        ] {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        for role in [Role::Member, Role::Admin, Role::Owner] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(ConversationKind::parse("group"), Some(ConversationKind::Group));
        assert_eq!(ConversationKind::parse("channel"), None);
    }

    #[test]
    fn conversation_member_lookup() {
        let now = Utc::now();
        let conv = Conversation {
            id: ConversationId::from("c1"),
            kind: ConversationKind::Group,
            name: Some("team".into()),
            description: None,
            created_by: UserId::from("alice"),
            members: vec![membership("alice", Role::Owner), membership("bob", Role::Member)],
            allow_invites: true,
            created_at: now,
            last_activity: now,
        };
        assert!(conv.is_member(&UserId::from("bob")));
        assert!(!conv.is_member(&UserId::from("carol")));
        assert_eq!(conv.member(&UserId::from("alice")).unwrap().role, Role::Owner);
        assert_eq!(conv.member_ids().len(), 2);
    }

    #[test]
    fn message_serializes_camel_case() {
        let msg = Message {
            id: MessageId::from("m1"),
            conversation_id: ConversationId::from("c1"),
            seq: 3,
            sender_id: Some(UserId::from("alice")),
            kind: MessageKind::Text,
            content: "hello".into(),
            reply_to: None,
            reactions: BTreeMap::from([(UserId::from("bob"), "👍".to_string())]),
            read_by: vec![],
            edited_at: None,
            deleted: false,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["conversationId"], "c1");
        assert_eq!(json["senderId"], "alice");
        assert_eq!(json["kind"], "text");
        assert_eq!(json["reactions"]["bob"], "👍");
        assert!(json.get("replyTo").is_none());
    }

    #[test]
    fn new_group_defaults_allow_invites() {
        let group: NewGroup = serde_json::from_value(serde_json::json!({
            "name": "team",
            "owner": "alice",
            "members": ["bob"]
        }))
        .unwrap();
        assert!(group.allow_invites);
        assert!(group.description.is_none());
    }
}
