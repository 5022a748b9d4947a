//! Engine-wide limits and timing windows.
//!
//! These are the compiled defaults; the server reads the timing values from
//! settings so deployments can tune them.

use std::time::Duration;

/// Maximum message content length in characters, after trimming.
pub const MAX_CONTENT_LENGTH: usize = 2000;
/// Maximum reaction length in characters. Emoji sequences can be several code points.
pub const MAX_EMOJI_LENGTH: usize = 10;
/// Minimum display name length.
pub const MIN_USER_NAME_LENGTH: usize = 2;
/// Maximum display name length.
pub const MAX_USER_NAME_LENGTH: usize = 50;
/// Maximum group name length.
pub const MAX_GROUP_NAME_LENGTH: usize = 100;
/// Maximum group description length.
pub const MAX_GROUP_DESCRIPTION_LENGTH: usize = 500;

/// Page size used when a caller does not ask for one.
pub const DEFAULT_PAGE_LIMIT: usize = 50;
/// Largest page a caller may request.
pub const MAX_PAGE_LIMIT: usize = 100;

/// Inactivity window after which a typing indicator is cleared.
pub const TYPING_WINDOW: Duration = Duration::from_secs(2);
/// How long invitees have to answer a call invitation.
pub const CALL_RESPONSE_WINDOW: Duration = Duration::from_secs(30);
/// Presence transitions inside this window collapse into one notification.
pub const PRESENCE_DEBOUNCE: Duration = Duration::from_millis(1500);
/// Interval at which a client without a live channel re-queries state.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Content that replaces a soft-deleted message.
pub const DELETED_MESSAGE_TEXT: &str = "This message was deleted";
