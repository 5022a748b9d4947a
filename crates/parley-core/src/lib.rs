//! # parley-core
//!
//! Shared vocabulary for every Parley crate:
//!
//! - **Branded IDs**: `UserId`, `ConversationId`, `MessageId`, `SessionId`, `CallId`
//! - **Model**: users, conversations, memberships, messages, reactions, read markers
//! - **Errors**: the [`ChatError`] taxonomy and its wire codes
//! - **Limits**: content length, page sizes, and the engine's timing windows

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod ids;
pub mod model;
pub mod validation;

pub use errors::{ChatError, ErrorBody, Result};
pub use ids::{CallId, ConversationId, MessageId, SessionId, UserId};
