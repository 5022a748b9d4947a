//! # parley-server
//!
//! Axum HTTP + `WebSocket` front end for the Parley sync engine.
//!
//! - `GET /ws`: authenticated live sessions with ping/pong heartbeat
//! - `/api/*`: REST fallback that calls the same engine operations
//! - `GET /health` and `GET /metrics` (Prometheus text format)
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod api;
pub mod auth;
pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use auth::{AuthError, Claims, TokenAuthority};
pub use config::ServerConfig;
pub use errors::ApiError;
pub use server::{AppState, ParleyServer};
pub use shutdown::ShutdownCoordinator;
