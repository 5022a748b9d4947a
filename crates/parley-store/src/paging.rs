//! Page assembly shared by the store implementations.

use parley_core::model::{Message, MessagePage, PageCursor};

/// Wrap an already-ordered (oldest-first) slice of messages as a page and
/// compute the cursor that continues in the same direction.
pub(crate) fn assemble(messages: Vec<Message>, has_more: bool, cursor: PageCursor) -> MessagePage {
    let next_cursor = if has_more {
        match cursor {
            PageCursor::After(_) => messages.last().map(|m| m.seq),
            PageCursor::Latest | PageCursor::Before(_) => messages.first().map(|m| m.seq),
        }
    } else {
        None
    };
    MessagePage {
        messages,
        has_more,
        next_cursor,
    }
}
