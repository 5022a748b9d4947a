//! REST fallback endpoints.
//!
//! Every route requires a bearer token and calls the same engine operation
//! as the matching live event, so clients without a live channel see the
//! same authorization, validation, and fan-out.

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router, middleware};
use parley_core::model::{
    Conversation, FriendRequest, FriendResponse, Membership, Message, MessageKind, MessagePage,
    PageCursor, PresenceSnapshot, Role, UserProfile,
};
use parley_core::{ChatError, ConversationId, MessageId, UserId};
use parley_sync::router::GroupDraft;
use parley_sync::{Actor, Draft};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::require_user;
use crate::errors::ApiError;
use crate::server::AppState;

type ApiResult<T> = Result<T, ApiError>;

/// Routes mounted under `/api`.
pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/conversations", get(list_conversations))
        .route("/conversations/direct", post(open_direct))
        .route("/conversations/group", post(create_group))
        .route(
            "/conversations/{id}/messages",
            get(list_messages).post(send_message),
        )
        .route("/conversations/{id}/read", post(mark_read))
        .route("/conversations/{id}/unread", get(unread_count))
        .route("/conversations/{id}/members", post(add_member))
        .route(
            "/conversations/{id}/members/{user_id}",
            axum::routing::delete(remove_member),
        )
        .route("/conversations/{id}/members/{user_id}/role", put(update_role))
        .route("/messages/{id}", axum::routing::patch(edit_message).delete(delete_message))
        .route("/messages/{id}/reaction", put(add_reaction).delete(remove_reaction))
        .route("/presence", get(presence))
        .route("/friends", get(list_friends))
        .route("/friends/{user_id}", axum::routing::delete(remove_friend))
        .route(
            "/friends/requests",
            get(pending_friend_requests).post(send_friend_request),
        )
        .route(
            "/friends/requests/{user_id}",
            axum::routing::delete(cancel_friend_request),
        )
        .route("/friends/requests/{user_id}/respond", post(respond_friend_request))
        .route_layer(middleware::from_fn_with_state(state, require_user))
}

// ── Request and response bodies ─────────────────────────────────────

/// Query string of `GET /conversations/{id}/messages`.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    /// Return messages with `seq` below this value.
    pub before: Option<u64>,
    /// Return messages with `seq` above this value.
    pub after: Option<u64>,
    /// Page size; defaults to 50, capped at 100.
    pub limit: Option<usize>,
}

impl HistoryQuery {
    fn cursor(&self) -> Result<PageCursor, ChatError> {
        match (self.before, self.after) {
            (None, None) => Ok(PageCursor::Latest),
            (Some(seq), None) => Ok(PageCursor::Before(seq)),
            (None, Some(seq)) => Ok(PageCursor::After(seq)),
            (Some(_), Some(_)) => Err(ChatError::validation(
                "use either before or after, not both",
            )),
        }
    }
}

/// Body of `POST /conversations/{id}/messages`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    /// Message text.
    pub content: String,
    /// Content kind, `text` when omitted.
    #[serde(default, alias = "messageType")]
    pub kind: MessageKind,
    /// Message being replied to.
    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

/// Body of `PATCH /messages/{id}`.
#[derive(Debug, Deserialize)]
pub struct EditMessageBody {
    /// Replacement text.
    pub content: String,
}

/// Body of `PUT /messages/{id}/reaction`.
#[derive(Debug, Deserialize)]
pub struct ReactionBody {
    /// The emoji to set.
    pub emoji: String,
}

/// Body of `POST /conversations/{id}/read`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadBody {
    /// Messages the caller has seen.
    pub message_ids: Vec<MessageId>,
}

/// Body naming another user.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBody {
    /// The user acted upon.
    pub user_id: UserId,
}

/// Body of `PUT /conversations/{id}/members/{user_id}/role`.
#[derive(Debug, Deserialize)]
pub struct RoleBody {
    /// `member` or `admin`.
    pub role: Role,
}

/// Body of `POST /friends/requests`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestBody {
    /// Addressee.
    pub user_id: UserId,
    /// Opaque data relayed to the addressee.
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Body of `POST /friends/requests/{user_id}/respond`.
#[derive(Debug, Deserialize)]
pub struct FriendResponseBody {
    /// Accept or reject.
    pub response: FriendResponse,
    /// Opaque data relayed to the requester.
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Response of `DELETE /messages/{id}/reaction`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Removed {
    /// Whether there was a reaction to remove.
    pub removed: bool,
}

/// Response of `POST /conversations/{id}/read`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Marked {
    /// Ids that were not already read.
    pub marked: Vec<MessageId>,
}

/// Response of `GET /conversations/{id}/unread`.
#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadCount {
    /// Messages the caller has not read.
    pub count: u64,
}

// ── Conversations ───────────────────────────────────────────────────

async fn list_conversations(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
) -> ApiResult<Json<Vec<Conversation>>> {
    let actor = Actor::rest(user);
    Ok(Json(state.engine.router().conversations(&actor).await?))
}

async fn open_direct(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
    Json(body): Json<UserBody>,
) -> ApiResult<Json<Conversation>> {
    let actor = Actor::rest(user);
    let conversation = state
        .engine
        .router()
        .open_direct_conversation(&actor, &body.user_id)
        .await?;
    Ok(Json(conversation))
}

async fn create_group(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
    Json(draft): Json<GroupDraft>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    let actor = Actor::rest(user);
    let conversation = state
        .engine
        .router()
        .create_group_conversation(&actor, draft)
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn add_member(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
    Path(id): Path<ConversationId>,
    Json(body): Json<UserBody>,
) -> ApiResult<(StatusCode, Json<Membership>)> {
    let actor = Actor::rest(user);
    let membership = state
        .engine
        .router()
        .add_member(&actor, &id, &body.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(membership)))
}

async fn remove_member(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
    Path((id, member)): Path<(ConversationId, UserId)>,
) -> ApiResult<StatusCode> {
    let actor = Actor::rest(user);
    state.engine.router().remove_member(&actor, &id, &member).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_role(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
    Path((id, member)): Path<(ConversationId, UserId)>,
    Json(body): Json<RoleBody>,
) -> ApiResult<Json<Membership>> {
    let actor = Actor::rest(user);
    let membership = state
        .engine
        .router()
        .update_role(&actor, &id, &member, body.role)
        .await?;
    Ok(Json(membership))
}

// ── Messages ────────────────────────────────────────────────────────

async fn list_messages(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
    Path(id): Path<ConversationId>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<MessagePage>> {
    let actor = Actor::rest(user);
    let cursor = query.cursor()?;
    let page = state
        .engine
        .router()
        .messages_page(&actor, &id, cursor, query.limit)
        .await?;
    Ok(Json(page))
}

async fn send_message(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
    Path(id): Path<ConversationId>,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let actor = Actor::rest(user);
    let draft = Draft {
        conversation_id: id,
        content: body.content,
        kind: body.kind,
        reply_to: body.reply_to,
    };
    let message = state.engine.router().send_message(&actor, draft).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn edit_message(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
    Path(id): Path<MessageId>,
    Json(body): Json<EditMessageBody>,
) -> ApiResult<Json<Message>> {
    let actor = Actor::rest(user);
    let message = state
        .engine
        .router()
        .edit_message(&actor, &id, &body.content)
        .await?;
    Ok(Json(message))
}

async fn delete_message(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
    Path(id): Path<MessageId>,
) -> ApiResult<Json<Message>> {
    let actor = Actor::rest(user);
    Ok(Json(state.engine.router().delete_message(&actor, &id).await?))
}

async fn add_reaction(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
    Path(id): Path<MessageId>,
    Json(body): Json<ReactionBody>,
) -> ApiResult<StatusCode> {
    let actor = Actor::rest(user);
    state
        .engine
        .router()
        .add_reaction(&actor, &id, &body.emoji)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_reaction(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
    Path(id): Path<MessageId>,
) -> ApiResult<Json<Removed>> {
    let actor = Actor::rest(user);
    let removed = state.engine.router().remove_reaction(&actor, &id).await?;
    Ok(Json(Removed { removed }))
}

async fn mark_read(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
    Path(id): Path<ConversationId>,
    Json(body): Json<MarkReadBody>,
) -> ApiResult<Json<Marked>> {
    let actor = Actor::rest(user);
    let marked = state
        .engine
        .router()
        .mark_read(&actor, &id, &body.message_ids)
        .await?;
    Ok(Json(Marked { marked }))
}

async fn unread_count(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
    Path(id): Path<ConversationId>,
) -> ApiResult<Json<UnreadCount>> {
    let actor = Actor::rest(user);
    let count = state.engine.router().unread_count(&actor, &id).await?;
    Ok(Json(UnreadCount { count }))
}

// ── Presence and friends ────────────────────────────────────────────

async fn presence(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
) -> ApiResult<Json<PresenceSnapshot>> {
    let friends = state.engine.friends_presence(&user.id).await?;
    Ok(Json(PresenceSnapshot {
        online: state.engine.online_users(),
        friends,
    }))
}

async fn send_friend_request(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
    Json(body): Json<FriendRequestBody>,
) -> ApiResult<(StatusCode, Json<FriendRequest>)> {
    let actor = Actor::rest(user);
    let request = state
        .engine
        .router()
        .send_friend_request(&actor, &body.user_id, body.payload)
        .await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn respond_friend_request(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
    Path(requester): Path<UserId>,
    Json(body): Json<FriendResponseBody>,
) -> ApiResult<StatusCode> {
    let actor = Actor::rest(user);
    state
        .engine
        .router()
        .respond_friend_request(&actor, &requester, body.response, body.payload)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_friends(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
) -> ApiResult<Json<Vec<UserProfile>>> {
    let actor = Actor::rest(user);
    Ok(Json(state.engine.router().friends(&actor).await?))
}

async fn remove_friend(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
    Path(friend): Path<UserId>,
) -> ApiResult<StatusCode> {
    let actor = Actor::rest(user);
    state.engine.router().remove_friend(&actor, &friend).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pending_friend_requests(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
) -> ApiResult<Json<Vec<FriendRequest>>> {
    let actor = Actor::rest(user);
    Ok(Json(
        state.engine.router().pending_friend_requests(&actor).await?,
    ))
}

async fn cancel_friend_request(
    State(state): State<AppState>,
    Extension(user): Extension<UserProfile>,
    Path(target): Path<UserId>,
) -> ApiResult<StatusCode> {
    let actor = Actor::rest(user);
    state
        .engine
        .router()
        .cancel_friend_request(&actor, &target)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
