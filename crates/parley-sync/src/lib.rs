//! # parley-sync
//!
//! The real-time synchronization engine.
//!
//! - [`registry`]: which users are connected, through which sessions
//! - [`rooms`]: which sessions are subscribed to which conversation
//! - [`router`]: the authorize → validate → write → fan-out pipeline shared
//!   by the live channel and the REST fallback
//! - [`presence`]: debounced online/offline notifications to friends
//! - [`typing`]: per (conversation, user) typing state with self-expiry
//! - [`calls`]: call invitation state machine with a response deadline
//! - [`engine`]: the [`SyncEngine`] facade that wires them together
//!
//! Durable state lives in the [`ChatStore`](parley_store::ChatStore); live
//! events are advisory, so a client that misses one re-fetches.

#![deny(unsafe_code)]

pub mod calls;
pub mod engine;
pub mod events;
pub mod fanout;
mod gates;
pub mod metrics;
pub mod presence;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod session;
pub mod timer;
pub mod typing;

pub use calls::{CallAnswer, CallCoordinator, CallInvitation, CallState};
pub use engine::{SyncConfig, SyncEngine};
pub use events::{ClientEvent, ReactionAction, ServerEvent};
pub use registry::ConnectionRegistry;
pub use rooms::RoomIndex;
pub use router::{Actor, Draft, EventRouter};
pub use session::Session;
