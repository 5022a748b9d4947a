//! Chat error taxonomy.
//!
//! Every engine operation fails with one of five classes. Only
//! [`ChatError::StoreUnavailable`] implies a failed write; the others are
//! raised before anything is persisted. [`ChatError::TransientDelivery`]
//! describes a single unreachable recipient and is logged, never returned
//! to the caller of a successful action.

use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

// ── Error code constants ────────────────────────────────────────────

/// Sender lacks membership or permission.
pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
/// Conversation, message, user, or call does not exist.
pub const NOT_FOUND: &str = "NOT_FOUND";
/// Malformed or out-of-bounds payload.
pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
/// A recipient session could not be reached.
pub const DELIVERY_FAILED: &str = "DELIVERY_FAILED";
/// The persistence store rejected or could not perform a write.
pub const STORE_UNAVAILABLE: &str = "STORE_UNAVAILABLE";

/// Error returned by engine operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// The caller is not allowed to act on the target.
    #[error("{message}")]
    Unauthorized {
        /// Why access was denied.
        message: String,
    },

    /// The target entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind (`conversation`, `message`, `user`, `call`).
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// The payload was rejected before any write.
    #[error("{message}")]
    Validation {
        /// What is wrong with the payload.
        message: String,
    },

    /// One recipient session was unreachable.
    #[error("delivery to session {session_id} failed")]
    TransientDelivery {
        /// Session whose queue was full or closed.
        session_id: SessionId,
    },

    /// The persistence store failed.
    #[error("store unavailable: {message}")]
    StoreUnavailable {
        /// Underlying store failure.
        message: String,
    },
}

impl ChatError {
    /// Build an [`ChatError::Unauthorized`].
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Build a [`ChatError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Build a [`ChatError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Build a [`ChatError::StoreUnavailable`].
    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => UNAUTHORIZED,
            Self::NotFound { .. } => NOT_FOUND,
            Self::Validation { .. } => VALIDATION_ERROR,
            Self::TransientDelivery { .. } => DELIVERY_FAILED,
            Self::StoreUnavailable { .. } => STORE_UNAVAILABLE,
        }
    }

    /// Convert to the wire-format error body.
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_owned(),
            message: self.to_string(),
        }
    }
}

/// Wire representation of a [`ChatError`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable reason.
    pub message: String,
}

/// Convenience alias for engine results.
pub type Result<T> = std::result::Result<T, ChatError>;
