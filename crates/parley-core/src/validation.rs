//! Payload validation shared by the live and REST entry points.
//!
//! Every check here runs before any store access, so a rejected payload
//! never produces a write.

use crate::constants::{
    DEFAULT_PAGE_LIMIT, MAX_EMOJI_LENGTH, MAX_GROUP_DESCRIPTION_LENGTH, MAX_GROUP_NAME_LENGTH,
    MAX_PAGE_LIMIT, MAX_USER_NAME_LENGTH, MIN_USER_NAME_LENGTH,
};
use crate::errors::{ChatError, Result};
use crate::model::MessageKind;

/// Validate a client-submitted message body and return it trimmed.
pub fn message_content(content: &str, kind: MessageKind, max_len: usize) -> Result<String> {
    if kind == MessageKind::System {
        return Err(ChatError::validation("system messages cannot be sent by clients"));
    }
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ChatError::validation("message content cannot be empty"));
    }
    let len = trimmed.chars().count();
    if len > max_len {
        return Err(ChatError::validation(format!(
            "message content is {len} characters, limit is {max_len}"
        )));
    }
    Ok(trimmed.to_owned())
}

/// Validate a reaction emoji and return it trimmed.
pub fn emoji(emoji: &str) -> Result<String> {
    let trimmed = emoji.trim();
    if trimmed.is_empty() {
        return Err(ChatError::validation("emoji is required"));
    }
    if trimmed.chars().count() > MAX_EMOJI_LENGTH {
        return Err(ChatError::validation("emoji is too long"));
    }
    Ok(trimmed.to_owned())
}

/// Validate a display name and return it trimmed.
pub fn user_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    let len = trimmed.chars().count();
    if !(MIN_USER_NAME_LENGTH..=MAX_USER_NAME_LENGTH).contains(&len) {
        return Err(ChatError::validation(format!(
            "name must be between {MIN_USER_NAME_LENGTH} and {MAX_USER_NAME_LENGTH} characters"
        )));
    }
    Ok(trimmed.to_owned())
}

/// Validate a group name and optional description.
pub fn group_details(name: &str, description: Option<&str>) -> Result<(String, Option<String>)> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ChatError::validation("group name is required"));
    }
    if name.chars().count() > MAX_GROUP_NAME_LENGTH {
        return Err(ChatError::validation(format!(
            "group name cannot exceed {MAX_GROUP_NAME_LENGTH} characters"
        )));
    }
    let description = description.map(str::trim).filter(|d| !d.is_empty());
    if description.is_some_and(|d| d.chars().count() > MAX_GROUP_DESCRIPTION_LENGTH) {
        return Err(ChatError::validation(format!(
            "group description cannot exceed {MAX_GROUP_DESCRIPTION_LENGTH} characters"
        )));
    }
    Ok((name.to_owned(), description.map(str::to_owned)))
}

/// Resolve a requested page size: default when absent, clamped to the maximum.
pub fn page_limit(requested: Option<usize>) -> usize {
    requested
        .filter(|n| *n > 0)
        .map_or(DEFAULT_PAGE_LIMIT, |n| n.min(MAX_PAGE_LIMIT))
}
