//! # parley-store
//!
//! The persistence collaborator the sync engine depends on.
//!
//! [`ChatStore`] is the only surface the engine sees. Two implementations
//! ship here: [`MemoryStore`] for tests and single-process demos, and
//! [`SqliteStore`] backed by a pooled, migrated `SQLite` database. Both
//! assign a per-conversation monotonic `seq` to every message so pages
//! reconstruct deterministically oldest-first.

#![deny(unsafe_code)]

pub mod errors;
pub mod memory;
mod paging;
pub mod sqlite;
pub mod traits;

pub use errors::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::{ConnectionConfig, SqliteStore};
pub use traits::ChatStore;
