//! # parley-client
//!
//! Client side of the Parley sync protocol.
//!
//! [`SyncClient`] tries the live `WebSocket` channel first. When the
//! handshake fails it falls back to a [`PollingChannel`] that re-queries
//! the REST endpoints on an interval and synthesizes the same
//! [`ServerEvent`](parley_sync::ServerEvent)s, so the application reads one
//! event stream either way.

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod errors;
pub mod fallback;
pub mod live;
pub mod rest;

pub use client::{SyncClient, Transport};
pub use config::ClientConfig;
pub use errors::{ClientError, Result};
pub use fallback::PollingChannel;
pub use live::LiveChannel;
pub use rest::RestClient;
