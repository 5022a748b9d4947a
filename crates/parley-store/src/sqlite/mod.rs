//! `SQLite`-backed [`ChatStore`].
//!
//! rusqlite is synchronous, so every trait method moves its owned arguments
//! into a closure that runs on [`tokio::task::spawn_blocking`] with a pooled
//! connection. Multi-statement writes run in a transaction.

pub mod connection;
pub mod migrations;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::constants::DELETED_MESSAGE_TEXT;
use parley_core::model::{
    Conversation, ConversationKind, FriendRequest, FriendResponse, Membership, Message,
    MessageKind, MessagePage, NewGroup, NewMessage, PageCursor, Presence, ReadMarker, Role,
    UserProfile,
};
use parley_core::{ConversationId, MessageId, UserId};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::info;

pub use connection::{ConnectionConfig, ConnectionPool};

use crate::errors::{Result, StoreError};
use crate::paging;
use crate::traits::ChatStore;

/// `SQLite` implementation of [`ChatStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: ConnectionPool,
}

impl SqliteStore {
    /// Open (or create) a database file and apply pending migrations.
    pub fn open(path: &str, config: &ConnectionConfig) -> Result<Self> {
        info!(path, "opening sqlite store");
        Self::from_pool(connection::new_file(path, config)?)
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::from_pool(connection::new_in_memory(&ConnectionConfig::default())?)
    }

    fn from_pool(pool: ConnectionPool) -> Result<Self> {
        {
            let conn = pool.get()?;
            let _ = migrations::run_migrations(&conn)?;
        }
        Ok(Self { pool })
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, seq, sender_id, kind, content, reply_to, edited_at, deleted, created_at";

const CONVERSATION_COLUMNS: &str =
    "id, kind, name, description, created_by, allow_invites, created_at, last_activity";

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or_default()
}

fn label<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown label {raw:?}").into(),
        )
    })
}

fn direct_key(a: &UserId, b: &UserId) -> String {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: MessageId::from(row.get::<_, String>(0)?),
        conversation_id: ConversationId::from(row.get::<_, String>(1)?),
        seq: to_u64(row.get(2)?),
        sender_id: row.get::<_, Option<String>>(3)?.map(UserId::from),
        kind: label(row, 4, MessageKind::parse)?,
        content: row.get(5)?,
        reply_to: row.get::<_, Option<String>>(6)?.map(MessageId::from),
        reactions: BTreeMap::new(),
        read_by: Vec::new(),
        edited_at: row.get(7)?,
        deleted: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: ConversationId::from(row.get::<_, String>(0)?),
        kind: label(row, 1, ConversationKind::parse)?,
        name: row.get(2)?,
        description: row.get(3)?,
        created_by: UserId::from(row.get::<_, String>(4)?),
        members: Vec::new(),
        allow_invites: row.get(5)?,
        created_at: row.get(6)?,
        last_activity: row.get(7)?,
    })
}

fn membership_from_row(row: &Row<'_>) -> rusqlite::Result<Membership> {
    Ok(Membership {
        conversation_id: ConversationId::from(row.get::<_, String>(0)?),
        user_id: UserId::from(row.get::<_, String>(1)?),
        role: label(row, 2, Role::parse)?,
        joined_at: row.get(3)?,
    })
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<UserProfile> {
    Ok(UserProfile {
        id: UserId::from(row.get::<_, String>(0)?),
        name: row.get(1)?,
        avatar: row.get(2)?,
    })
}

// ── Query helpers ───────────────────────────────────────────────────

fn load_user(conn: &Connection, id: &str) -> Result<Option<UserProfile>> {
    Ok(conn
        .query_row(
            "SELECT id, name, avatar FROM users WHERE id = ?1",
            [id],
            profile_from_row,
        )
        .optional()?)
}

fn require_user(conn: &Connection, id: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
        [id],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(StoreError::not_found("user", id))
    }
}

fn require_conversation(conn: &Connection, id: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1)",
        [id],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(StoreError::not_found("conversation", id))
    }
}

fn require_message(conn: &Connection, id: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1)",
        [id],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(StoreError::not_found("message", id))
    }
}

fn load_members(conn: &Connection, conversation: &str) -> Result<Vec<Membership>> {
    let mut stmt = conn.prepare_cached(
        "SELECT conversation_id, user_id, role, joined_at FROM memberships
         WHERE conversation_id = ?1 ORDER BY joined_at, rowid",
    )?;
    let rows = stmt.query_map([conversation], membership_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn load_membership(conn: &Connection, conversation: &str, user: &str) -> Result<Option<Membership>> {
    Ok(conn
        .query_row(
            "SELECT conversation_id, user_id, role, joined_at FROM memberships
             WHERE conversation_id = ?1 AND user_id = ?2",
            [conversation, user],
            membership_from_row,
        )
        .optional()?)
}

fn load_conversation(conn: &Connection, id: &str) -> Result<Option<Conversation>> {
    let found = conn
        .query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            [id],
            conversation_from_row,
        )
        .optional()?;
    match found {
        Some(mut conversation) => {
            conversation.members = load_members(conn, id)?;
            Ok(Some(conversation))
        }
        None => Ok(None),
    }
}

fn hydrate(conn: &Connection, mut message: Message) -> Result<Message> {
    message.reactions = load_reactions(conn, &message.id)?;
    let mut stmt = conn.prepare_cached(
        "SELECT user_id, read_at FROM read_markers WHERE message_id = ?1 ORDER BY read_at, rowid",
    )?;
    let markers = stmt.query_map([message.id.as_str()], |row| {
        Ok(ReadMarker {
            user_id: UserId::from(row.get::<_, String>(0)?),
            read_at: row.get(1)?,
        })
    })?;
    message.read_by = markers.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(message)
}

fn load_reactions(conn: &Connection, message: &str) -> Result<BTreeMap<UserId, String>> {
    let mut stmt =
        conn.prepare_cached("SELECT user_id, emoji FROM reactions WHERE message_id = ?1")?;
    let rows = stmt.query_map([message], |row| {
        Ok((UserId::from(row.get::<_, String>(0)?), row.get::<_, String>(1)?))
    })?;
    Ok(rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()?)
}

fn load_message(conn: &Connection, id: &str) -> Result<Option<Message>> {
    let found = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            [id],
            message_from_row,
        )
        .optional()?;
    found.map(|m| hydrate(conn, m)).transpose()
}

fn request_exists(conn: &Connection, from: &str, to: &str) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM friend_requests WHERE from_id = ?1 AND to_id = ?2)",
        [from, to],
        |row| row.get(0),
    )?)
}

fn insert_membership(
    conn: &Connection,
    conversation: &str,
    user: &str,
    role: Role,
    at: DateTime<Utc>,
) -> Result<()> {
    let _ = conn.execute(
        "INSERT OR IGNORE INTO memberships (conversation_id, user_id, role, joined_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![conversation, user, role.as_str(), at],
    )?;
    Ok(())
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn create_user(&self, name: &str, avatar: Option<&str>) -> Result<UserProfile> {
        let profile = UserProfile {
            id: UserId::new(),
            name: name.to_owned(),
            avatar: avatar.map(str::to_owned),
        };
        let row = profile.clone();
        self.run(move |conn| {
            let _ = conn.execute(
                "INSERT INTO users (id, name, avatar, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![row.id.as_str(), row.name, row.avatar, Utc::now()],
            )?;
            Ok(())
        })
        .await?;
        Ok(profile)
    }

    async fn user(&self, id: &UserId) -> Result<Option<UserProfile>> {
        let id = id.clone();
        self.run(move |conn| load_user(conn, &id)).await
    }

    async fn users(&self, ids: &[UserId]) -> Result<Vec<UserProfile>> {
        let ids = ids.to_vec();
        self.run(move |conn| {
            let mut found = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(profile) = load_user(conn, id)? {
                    found.push(profile);
                }
            }
            Ok(found)
        })
        .await
    }

    async fn set_presence(&self, user: &UserId, online: bool, at: DateTime<Utc>) -> Result<()> {
        let user = user.clone();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE users SET is_online = ?2,
                   last_seen = CASE WHEN ?2 THEN last_seen ELSE ?3 END
                 WHERE id = ?1",
                params![user.as_str(), online, at],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("user", &user));
            }
            Ok(())
        })
        .await
    }

    async fn presence(&self, user: &UserId) -> Result<Presence> {
        let user = user.clone();
        self.run(move |conn| {
            conn.query_row(
                "SELECT is_online, last_seen FROM users WHERE id = ?1",
                [user.as_str()],
                |row| Ok((row.get::<_, bool>(0)?, row.get(1)?)),
            )
            .optional()?
            .map(|(is_online, last_seen)| Presence {
                user_id: user.clone(),
                is_online,
                last_seen,
            })
            .ok_or_else(|| StoreError::not_found("user", &user))
        })
        .await
    }

    async fn friend_ids(&self, user: &UserId) -> Result<Vec<UserId>> {
        let user = user.clone();
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT friend_id FROM friendships WHERE user_id = ?1 ORDER BY friend_id",
            )?;
            let rows = stmt.query_map([user.as_str()], |row| {
                row.get::<_, String>(0).map(UserId::from)
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn send_friend_request(&self, from: &UserId, to: &UserId) -> Result<FriendRequest> {
        if from == to {
            return Err(StoreError::Conflict(
                "cannot send a friend request to yourself".into(),
            ));
        }
        let request = FriendRequest {
            from: from.clone(),
            to: to.clone(),
            sent_at: Utc::now(),
        };
        let row = request.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            require_user(&tx, &row.to)?;
            require_user(&tx, &row.from)?;
            let friends: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM friendships WHERE user_id = ?1 AND friend_id = ?2)",
                [row.from.as_str(), row.to.as_str()],
                |r| r.get(0),
            )?;
            if friends {
                return Err(StoreError::Conflict("already friends".into()));
            }
            if request_exists(&tx, &row.from, &row.to)? {
                return Err(StoreError::Conflict("friend request already sent".into()));
            }
            if request_exists(&tx, &row.to, &row.from)? {
                return Err(StoreError::Conflict(
                    "this user has already sent you a friend request".into(),
                ));
            }
            let _ = tx.execute(
                "INSERT INTO friend_requests (from_id, to_id, sent_at) VALUES (?1, ?2, ?3)",
                params![row.from.as_str(), row.to.as_str(), row.sent_at],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?;
        Ok(request)
    }

    async fn respond_friend_request(
        &self,
        responder: &UserId,
        requester: &UserId,
        response: FriendResponse,
    ) -> Result<()> {
        let responder = responder.clone();
        let requester = requester.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM friend_requests WHERE from_id = ?1 AND to_id = ?2",
                [requester.as_str(), responder.as_str()],
            )?;
            if removed == 0 {
                return Err(StoreError::not_found("friend request", &requester));
            }
            if response == FriendResponse::Accepted {
                let now = Utc::now();
                for (a, b) in [(&responder, &requester), (&requester, &responder)] {
                    let _ = tx.execute(
                        "INSERT OR IGNORE INTO friendships (user_id, friend_id, created_at)
                         VALUES (?1, ?2, ?3)",
                        params![a.as_str(), b.as_str(), now],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn cancel_friend_request(&self, from: &UserId, to: &UserId) -> Result<()> {
        let from = from.clone();
        let to = to.clone();
        self.run(move |conn| {
            let removed = conn.execute(
                "DELETE FROM friend_requests WHERE from_id = ?1 AND to_id = ?2",
                [from.as_str(), to.as_str()],
            )?;
            if removed == 0 {
                return Err(StoreError::not_found("friend request", &to));
            }
            Ok(())
        })
        .await
    }

    async fn remove_friend(&self, user: &UserId, friend: &UserId) -> Result<()> {
        let user = user.clone();
        let friend = friend.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM friendships WHERE user_id = ?1 AND friend_id = ?2",
                [user.as_str(), friend.as_str()],
            )?;
            if removed == 0 {
                return Err(StoreError::not_found("friend", &friend));
            }
            let _ = tx.execute(
                "DELETE FROM friendships WHERE user_id = ?1 AND friend_id = ?2",
                [friend.as_str(), user.as_str()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn pending_friend_requests(&self, user: &UserId) -> Result<Vec<FriendRequest>> {
        let user = user.clone();
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT from_id, to_id, sent_at FROM friend_requests
                 WHERE to_id = ?1 ORDER BY sent_at",
            )?;
            let rows = stmt.query_map([user.as_str()], |row| {
                Ok(FriendRequest {
                    from: UserId::from(row.get::<_, String>(0)?),
                    to: UserId::from(row.get::<_, String>(1)?),
                    sent_at: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        let id = id.clone();
        self.run(move |conn| load_conversation(conn, &id)).await
    }

    async fn conversation_members(&self, id: &ConversationId) -> Result<Vec<Membership>> {
        let id = id.clone();
        self.run(move |conn| {
            require_conversation(conn, &id)?;
            load_members(conn, &id)
        })
        .await
    }

    async fn membership(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<Option<Membership>> {
        let conversation = conversation.clone();
        let user = user.clone();
        self.run(move |conn| load_membership(conn, &conversation, &user))
            .await
    }

    async fn conversations_for_user(&self, user: &UserId) -> Result<Vec<Conversation>> {
        let user = user.clone();
        self.run(move |conn| {
            let ids = {
                let mut stmt = conn.prepare_cached(
                    "SELECT c.id FROM conversations c
                     JOIN memberships m ON m.conversation_id = c.id
                     WHERE m.user_id = ?1
                     ORDER BY c.last_activity DESC, c.rowid DESC",
                )?;
                let rows = stmt.query_map([user.as_str()], |row| row.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            let mut list = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(conversation) = load_conversation(conn, &id)? {
                    list.push(conversation);
                }
            }
            Ok(list)
        })
        .await
    }

    async fn create_direct_conversation(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> Result<(Conversation, bool)> {
        let a = a.clone();
        let b = b.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            require_user(&tx, &a)?;
            require_user(&tx, &b)?;
            let key = direct_key(&a, &b);
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM conversations WHERE direct_key = ?1",
                    [key.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let (id, created) = match existing {
                Some(id) => (id, false),
                None => {
                    let id = ConversationId::new().into_inner();
                    let now = Utc::now();
                    let _ = tx.execute(
                        "INSERT INTO conversations
                           (id, kind, created_by, allow_invites, direct_key, created_at, last_activity)
                         VALUES (?1, 'direct', ?2, 0, ?3, ?4, ?4)",
                        params![id, a.as_str(), key, now],
                    )?;
                    insert_membership(&tx, &id, &a, Role::Member, now)?;
                    insert_membership(&tx, &id, &b, Role::Member, now)?;
                    (id, true)
                }
            };
            let conversation = load_conversation(&tx, &id)?
                .ok_or_else(|| StoreError::not_found("conversation", &id))?;
            tx.commit()?;
            Ok((conversation, created))
        })
        .await
    }

    async fn create_group_conversation(&self, group: NewGroup) -> Result<Conversation> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            require_user(&tx, &group.owner)?;
            for member in &group.members {
                require_user(&tx, member)?;
            }
            let id = ConversationId::new().into_inner();
            let now = Utc::now();
            let _ = tx.execute(
                "INSERT INTO conversations
                   (id, kind, name, description, created_by, allow_invites, created_at, last_activity)
                 VALUES (?1, 'group', ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    id,
                    group.name,
                    group.description,
                    group.owner.as_str(),
                    group.allow_invites,
                    now
                ],
            )?;
            insert_membership(&tx, &id, &group.owner, Role::Owner, now)?;
            for member in group.members.iter().filter(|m| **m != group.owner) {
                insert_membership(&tx, &id, member, Role::Member, now)?;
            }
            let conversation = load_conversation(&tx, &id)?
                .ok_or_else(|| StoreError::not_found("conversation", &id))?;
            tx.commit()?;
            Ok(conversation)
        })
        .await
    }

    async fn add_member(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        role: Role,
    ) -> Result<Membership> {
        let conversation = conversation.clone();
        let user = user.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            require_user(&tx, &user)?;
            require_conversation(&tx, &conversation)?;
            if load_membership(&tx, &conversation, &user)?.is_some() {
                return Err(StoreError::Conflict(
                    "user is already a participant".into(),
                ));
            }
            insert_membership(&tx, &conversation, &user, role, Utc::now())?;
            let membership = load_membership(&tx, &conversation, &user)?
                .ok_or_else(|| StoreError::not_found("membership", &user))?;
            tx.commit()?;
            Ok(membership)
        })
        .await
    }

    async fn remove_member(&self, conversation: &ConversationId, user: &UserId) -> Result<()> {
        let conversation = conversation.clone();
        let user = user.clone();
        self.run(move |conn| {
            require_conversation(conn, &conversation)?;
            let removed = conn.execute(
                "DELETE FROM memberships WHERE conversation_id = ?1 AND user_id = ?2",
                [conversation.as_str(), user.as_str()],
            )?;
            if removed == 0 {
                return Err(StoreError::not_found("membership", &user));
            }
            Ok(())
        })
        .await
    }

    async fn update_role(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        role: Role,
    ) -> Result<Membership> {
        let conversation = conversation.clone();
        let user = user.clone();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE memberships SET role = ?3 WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation.as_str(), user.as_str(), role.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("membership", &user));
            }
            load_membership(conn, &conversation, &user)?
                .ok_or_else(|| StoreError::not_found("membership", &user))
        })
        .await
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            let seq: Option<i64> = tx
                .query_row(
                    "UPDATE conversations SET next_seq = next_seq + 1, last_activity = ?2
                     WHERE id = ?1 RETURNING next_seq",
                    params![message.conversation_id.as_str(), now],
                    |row| row.get(0),
                )
                .optional()?;
            let seq = seq
                .ok_or_else(|| StoreError::not_found("conversation", &message.conversation_id))?;
            let stored = Message {
                id: MessageId::new(),
                conversation_id: message.conversation_id,
                seq: to_u64(seq),
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
            let _ = tx.execute(
                "INSERT INTO messages
                   (id, conversation_id, seq, sender_id, kind, content, reply_to, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    stored.id.as_str(),
                    stored.conversation_id.as_str(),
                    seq,
                    stored.sender_id.as_deref(),
                    stored.kind.as_str(),
                    stored.content,
                    stored.reply_to.as_deref(),
                    now
                ],
            )?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn message(&self, id: &MessageId) -> Result<Option<Message>> {
        let id = id.clone();
        self.run(move |conn| load_message(conn, &id)).await
    }

    async fn messages_page(
        &self,
        conversation: &ConversationId,
        cursor: PageCursor,
        limit: usize,
    ) -> Result<MessagePage> {
        let conversation = conversation.clone();
        self.run(move |conn| {
            require_conversation(conn, &conversation)?;
            let fetch = i64::try_from(limit.saturating_add(1)).unwrap_or(i64::MAX);
            let (sql, bound) = match cursor {
                PageCursor::After(after) => (
                    format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages
                         WHERE conversation_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3"
                    ),
                    to_i64(after),
                ),
                PageCursor::Before(before) => (
                    format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages
                         WHERE conversation_id = ?1 AND seq < ?2 ORDER BY seq DESC LIMIT ?3"
                    ),
                    to_i64(before),
                ),
                PageCursor::Latest => (
                    format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages
                         WHERE conversation_id = ?1 AND seq < ?2 ORDER BY seq DESC LIMIT ?3"
                    ),
                    i64::MAX,
                ),
            };
            let rows = {
                let mut stmt = conn.prepare(&sql)?;
                let mapped = stmt.query_map(
                    params![conversation.as_str(), bound, fetch],
                    message_from_row,
                )?;
                mapped.collect::<rusqlite::Result<Vec<_>>>()?
            };
            let has_more = rows.len() > limit;
            let mut messages = rows
                .into_iter()
                .take(limit)
                .map(|m| hydrate(conn, m))
                .collect::<Result<Vec<_>>>()?;
            if !matches!(cursor, PageCursor::After(_)) {
                messages.reverse();
            }
            Ok(paging::assemble(messages, has_more, cursor))
        })
        .await
    }

    async fn edit_message(
        &self,
        id: &MessageId,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<Message> {
        let id = id.clone();
        let content = content.to_owned();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE messages SET content = ?2, edited_at = ?3 WHERE id = ?1",
                params![id.as_str(), content, at],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("message", &id));
            }
            load_message(conn, &id)?.ok_or_else(|| StoreError::not_found("message", &id))
        })
        .await
    }

    async fn delete_message(&self, id: &MessageId, at: DateTime<Utc>) -> Result<Message> {
        let id = id.clone();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE messages SET deleted = 1, content = ?2, edited_at = ?3 WHERE id = ?1",
                params![id.as_str(), DELETED_MESSAGE_TEXT, at],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("message", &id));
            }
            load_message(conn, &id)?.ok_or_else(|| StoreError::not_found("message", &id))
        })
        .await
    }

    async fn upsert_reaction(
        &self,
        message: &MessageId,
        user: &UserId,
        emoji: &str,
    ) -> Result<()> {
        let message = message.clone();
        let user = user.clone();
        let emoji = emoji.to_owned();
        self.run(move |conn| {
            require_message(conn, &message)?;
            let _ = conn.execute(
                "INSERT INTO reactions (message_id, user_id, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (message_id, user_id)
                 DO UPDATE SET emoji = excluded.emoji, created_at = excluded.created_at",
                params![message.as_str(), user.as_str(), emoji, Utc::now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_reaction(&self, message: &MessageId, user: &UserId) -> Result<bool> {
        let message = message.clone();
        let user = user.clone();
        self.run(move |conn| {
            require_message(conn, &message)?;
            let removed = conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2",
                [message.as_str(), user.as_str()],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn reactions(&self, message: &MessageId) -> Result<BTreeMap<UserId, String>> {
        let message = message.clone();
        self.run(move |conn| {
            require_message(conn, &message)?;
            load_reactions(conn, &message)
        })
        .await
    }

    async fn mark_read(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        message_ids: &[MessageId],
    ) -> Result<Vec<MessageId>> {
        let conversation = conversation.clone();
        let user = user.clone();
        let ids = message_ids.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            let mut marked = Vec::new();
            for id in ids {
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO read_markers (message_id, user_id, read_at)
                     SELECT id, ?2, ?3 FROM messages
                     WHERE id = ?1 AND conversation_id = ?4
                       AND (sender_id IS NULL OR sender_id != ?2)",
                    params![id.as_str(), user.as_str(), now, conversation.as_str()],
                )?;
                if inserted > 0 {
                    marked.push(id);
                }
            }
            tx.commit()?;
            Ok(marked)
        })
        .await
    }

    async fn unread_count(&self, conversation: &ConversationId, user: &UserId) -> Result<u64> {
        let conversation = conversation.clone();
        let user = user.clone();
        self.run(move |conn| {
            require_conversation(conn, &conversation)?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages m
                 WHERE m.conversation_id = ?1 AND m.deleted = 0
                   AND (m.sender_id IS NULL OR m.sender_id != ?2)
                   AND NOT EXISTS (
                     SELECT 1 FROM read_markers r WHERE r.message_id = m.id AND r.user_id = ?2
                   )",
                [conversation.as_str(), user.as_str()],
                |row| row.get(0),
            )?;
            Ok(to_u64(count))
        })
        .await
    }
}
