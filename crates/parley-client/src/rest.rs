//! Typed wrapper over the REST endpoints.

use parley_core::model::{
    Conversation, FriendRequest, FriendResponse, Membership, Message, MessageKind, MessagePage,
    PageCursor, PresenceSnapshot, Role, UserProfile,
};
use parley_core::{ConversationId, ErrorBody, MessageId, UserId};
use parley_sync::router::GroupDraft;
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::errors::{ClientError, Result};

/// Authenticated REST client.
#[derive(Clone, Debug)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestClient {
    /// Client for `base_url` (no trailing slash) acting with `token`.
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            token: token.to_owned(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{path}", self.base_url)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .json::<ErrorBody>()
            .await
            .unwrap_or_else(|_| ErrorBody {
                code: "HTTP_ERROR".into(),
                message: status.to_string(),
            });
        Err(ClientError::Api {
            status: status.as_u16(),
            body,
        })
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        Ok(self.execute(request).await?.json::<T>().await?)
    }

    // ── Conversations ───────────────────────────────────────────────

    /// Conversations the caller belongs to.
    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        self.fetch(self.http.get(self.url("/conversations"))).await
    }

    /// Open (or reuse) a direct conversation with a friend.
    pub async fn open_direct(&self, peer: &UserId) -> Result<Conversation> {
        let request = self
            .http
            .post(self.url("/conversations/direct"))
            .json(&json!({ "userId": peer }));
        self.fetch(request).await
    }

    /// Create a group.
    pub async fn create_group(&self, draft: &GroupDraft) -> Result<Conversation> {
        let request = self.http.post(self.url("/conversations/group")).json(draft);
        self.fetch(request).await
    }

    /// Add a friend to a group.
    pub async fn add_member(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<Membership> {
        let request = self
            .http
            .post(self.url(&format!("/conversations/{conversation}/members")))
            .json(&json!({ "userId": user }));
        self.fetch(request).await
    }

    /// Remove a member, or leave when `user` is the caller.
    pub async fn remove_member(&self, conversation: &ConversationId, user: &UserId) -> Result<()> {
        let request = self
            .http
            .delete(self.url(&format!("/conversations/{conversation}/members/{user}")));
        let _ = self.execute(request).await?;
        Ok(())
    }

    /// Promote or demote a group member. Owner only.
    pub async fn update_role(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        role: Role,
    ) -> Result<Membership> {
        let request = self
            .http
            .put(self.url(&format!("/conversations/{conversation}/members/{user}/role")))
            .json(&json!({ "role": role }));
        self.fetch(request).await
    }

    // ── Messages ────────────────────────────────────────────────────

    /// A page of history.
    pub async fn messages(
        &self,
        conversation: &ConversationId,
        cursor: PageCursor,
        limit: Option<usize>,
    ) -> Result<MessagePage> {
        let mut query: Vec<(&str, String)> = Vec::new();
        match cursor {
            PageCursor::Latest => {}
            PageCursor::Before(seq) => query.push(("before", seq.to_string())),
            PageCursor::After(seq) => query.push(("after", seq.to_string())),
        }
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        let request = self
            .http
            .get(self.url(&format!("/conversations/{conversation}/messages")))
            .query(&query);
        self.fetch(request).await
    }

    /// Post a message.
    pub async fn send_message(
        &self,
        conversation: &ConversationId,
        content: &str,
        kind: MessageKind,
        reply_to: Option<&MessageId>,
    ) -> Result<Message> {
        let request = self
            .http
            .post(self.url(&format!("/conversations/{conversation}/messages")))
            .json(&json!({ "content": content, "kind": kind, "replyTo": reply_to }));
        self.fetch(request).await
    }

    /// Edit one of the caller's messages.
    pub async fn edit_message(&self, id: &MessageId, content: &str) -> Result<Message> {
        let request = self
            .http
            .patch(self.url(&format!("/messages/{id}")))
            .json(&json!({ "content": content }));
        self.fetch(request).await
    }

    /// Delete one of the caller's messages.
    pub async fn delete_message(&self, id: &MessageId) -> Result<Message> {
        self.fetch(self.http.delete(self.url(&format!("/messages/{id}"))))
            .await
    }

    /// Set the caller's reaction.
    pub async fn add_reaction(&self, id: &MessageId, emoji: &str) -> Result<()> {
        let request = self
            .http
            .put(self.url(&format!("/messages/{id}/reaction")))
            .json(&json!({ "emoji": emoji }));
        let _ = self.execute(request).await?;
        Ok(())
    }

    /// Clear the caller's reaction. Returns whether there was one.
    pub async fn remove_reaction(&self, id: &MessageId) -> Result<bool> {
        #[derive(Deserialize)]
        struct Removed {
            removed: bool,
        }
        let removed: Removed = self
            .fetch(self.http.delete(self.url(&format!("/messages/{id}/reaction"))))
            .await?;
        Ok(removed.removed)
    }

    /// Mark messages read. Returns the ids that were newly marked.
    pub async fn mark_read(
        &self,
        conversation: &ConversationId,
        message_ids: &[MessageId],
    ) -> Result<Vec<MessageId>> {
        #[derive(Deserialize)]
        struct Marked {
            marked: Vec<MessageId>,
        }
        let request = self
            .http
            .post(self.url(&format!("/conversations/{conversation}/read")))
            .json(&json!({ "messageIds": message_ids }));
        let marked: Marked = self.fetch(request).await?;
        Ok(marked.marked)
    }

    /// Unread messages in a conversation.
    pub async fn unread_count(&self, conversation: &ConversationId) -> Result<u64> {
        let value: Value = self
            .fetch(
                self.http
                    .get(self.url(&format!("/conversations/{conversation}/unread"))),
            )
            .await?;
        Ok(value["count"].as_u64().unwrap_or_default())
    }

    // ── Presence and friends ────────────────────────────────────────

    /// Online users and the caller's friends' presence.
    pub async fn presence(&self) -> Result<PresenceSnapshot> {
        self.fetch(self.http.get(self.url("/presence"))).await
    }

    /// Send a friend request.
    pub async fn send_friend_request(
        &self,
        target: &UserId,
        payload: Option<&Value>,
    ) -> Result<FriendRequest> {
        let request = self
            .http
            .post(self.url("/friends/requests"))
            .json(&json!({ "userId": target, "payload": payload }));
        self.fetch(request).await
    }

    /// Answer a pending request from `requester`.
    pub async fn respond_friend_request(
        &self,
        requester: &UserId,
        response: FriendResponse,
        payload: Option<&Value>,
    ) -> Result<()> {
        let request = self
            .http
            .post(self.url(&format!("/friends/requests/{requester}/respond")))
            .json(&json!({ "response": response, "payload": payload }));
        let _ = self.execute(request).await?;
        Ok(())
    }

    /// Withdraw a request the caller sent to `target`.
    pub async fn cancel_friend_request(&self, target: &UserId) -> Result<()> {
        let request = self
            .http
            .delete(self.url(&format!("/friends/requests/{target}")));
        let _ = self.execute(request).await?;
        Ok(())
    }

    /// Requests waiting for the caller's answer.
    pub async fn pending_friend_requests(&self) -> Result<Vec<FriendRequest>> {
        self.fetch(self.http.get(self.url("/friends/requests"))).await
    }

    /// The caller's friends.
    pub async fn friends(&self) -> Result<Vec<UserProfile>> {
        self.fetch(self.http.get(self.url("/friends"))).await
    }

    /// End a friendship.
    pub async fn remove_friend(&self, friend: &UserId) -> Result<()> {
        let request = self.http.delete(self.url(&format!("/friends/{friend}")));
        let _ = self.execute(request).await?;
        Ok(())
    }
}
