//! `GET /ws`: the live transport.

pub mod heartbeat;
pub mod session;

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{HeaderMap, Uri};
use axum::response::Response;
use metrics::counter;
use tracing::{debug, warn};

use crate::auth;
use crate::errors::ApiError;
use crate::metrics::WS_REJECTED_TOTAL;
use crate::server::AppState;

/// Authenticate, take a connection slot, and upgrade.
///
/// Unknown or missing tokens get 401; a full server or one that is
/// shutting down gets 503.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ApiError> {
    if state.shutdown.is_shutting_down() {
        counter!(WS_REJECTED_TOTAL, "reason" => "shutdown").increment(1);
        return Err(ApiError::ShuttingDown);
    }
    let user = match auth::authenticate(&state, &headers, &uri).await {
        Ok(user) => user,
        Err(e) => {
            debug!(error = %e, "websocket upgrade rejected");
            counter!(WS_REJECTED_TOTAL, "reason" => "auth").increment(1);
            return Err(e);
        }
    };
    let Ok(permit) = Arc::clone(&state.slots).try_acquire_owned() else {
        warn!(user_id = %user.id, max = state.config.max_connections, "connection limit reached");
        counter!(WS_REJECTED_TOTAL, "reason" => "capacity").increment(1);
        return Err(ApiError::AtCapacity);
    };

    let max_message_size = state.config.max_message_size;
    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| session::run_ws_session(socket, user, state, permit)))
}
