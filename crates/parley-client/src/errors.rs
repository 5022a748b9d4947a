//! Client error types.

use parley_core::ErrorBody;
use tokio_tungstenite::tungstenite;

/// Errors returned by the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The `WebSocket` handshake or stream failed.
    #[error("websocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    /// The HTTP request failed before a response arrived.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// A REST call returned an error status.
    #[error("request failed with {status}: {} ({})", body.message, body.code)]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error body from the server.
        body: ErrorBody,
    },

    /// The server rejected a live event in its ack.
    #[error("rejected: {} ({})", .0.message, .0.code)]
    Rejected(ErrorBody),

    /// A payload could not be (de)serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configured base URL is not `http://` or `https://`.
    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    /// The token cannot be sent as a header value.
    #[error("token contains characters not allowed in a header")]
    InvalidToken,

    /// The event has no REST equivalent.
    #[error("{0} is only available on the live channel")]
    LiveOnly(&'static str),

    /// No ack arrived in time.
    #[error("no ack for request {0}")]
    AckTimeout(String),

    /// The channel was closed.
    #[error("channel closed")]
    Closed,
}

impl ClientError {
    /// Server error code, when the server produced one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { body, .. } | Self::Rejected(body) => Some(&body.code),
            _ => None,
        }
    }
}

impl From<tungstenite::Error> for ClientError {
    fn from(e: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

/// Convenience alias for client results.
pub type Result<T> = std::result::Result<T, ClientError>;
