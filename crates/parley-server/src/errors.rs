//! HTTP error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use metrics::counter;
use parley_core::{ChatError, ErrorBody};

use crate::auth::AuthError;
use crate::metrics::API_ERRORS_TOTAL;

/// Wire code for failed authentication.
pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
/// Wire code when no session slot is free or the server is stopping.
pub const UNAVAILABLE: &str = "UNAVAILABLE";

/// Error returned by HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// An engine operation failed.
    #[error(transparent)]
    Chat(#[from] ChatError),

    /// The caller could not be authenticated.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Every session slot is taken.
    #[error("server is at capacity")]
    AtCapacity,

    /// The server is shutting down.
    #[error("server is shutting down")]
    ShuttingDown,
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Chat(e) => match e {
                ChatError::Unauthorized { .. } => StatusCode::FORBIDDEN,
                ChatError::NotFound { .. } => StatusCode::NOT_FOUND,
                ChatError::Validation { .. } => StatusCode::BAD_REQUEST,
                ChatError::TransientDelivery { .. } => StatusCode::BAD_GATEWAY,
                ChatError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            },
            Self::Auth(AuthError::Sign(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::AtCapacity | Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// JSON body for this error.
    pub fn body(&self) -> ErrorBody {
        match self {
            Self::Chat(e) => e.to_error_body(),
            Self::Auth(e) => ErrorBody {
                code: UNAUTHENTICATED.into(),
                message: e.to_string(),
            },
            Self::AtCapacity | Self::ShuttingDown => ErrorBody {
                code: UNAVAILABLE.into(),
                message: self.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = self.body();
        counter!(API_ERRORS_TOTAL, "code" => body.code.clone()).increment(1);
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{SessionId, UserId};

    #[test]
    fn chat_errors_map_to_statuses() {
        let cases = [
            (ChatError::unauthorized("no"), StatusCode::FORBIDDEN),
            (ChatError::not_found("message", "m1"), StatusCode::NOT_FOUND),
            (ChatError::validation("empty"), StatusCode::BAD_REQUEST),
            (
                ChatError::TransientDelivery {
                    session_id: SessionId::from("s1"),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (ChatError::store("down"), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }

    #[test]
    fn chat_error_body_keeps_wire_code() {
        let body = ApiError::from(ChatError::not_found("message", "m1")).body();
        assert_eq!(body.code, "NOT_FOUND");
        assert!(body.message.contains("m1"));
    }

    #[test]
    fn auth_errors_are_401() {
        let err = ApiError::from(AuthError::UnknownUser(UserId::from("ghost")));
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.body().code, UNAUTHENTICATED);
        assert_eq!(ApiError::from(AuthError::Missing).status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn capacity_is_503() {
        assert_eq!(ApiError::AtCapacity.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ApiError::ShuttingDown.body().code, UNAVAILABLE);
    }

    #[tokio::test]
    async fn response_has_json_body() {
        let resp = ApiError::from(ChatError::validation("empty")).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.code, "VALIDATION_ERROR");
    }
}
