//! Server assembly: shared state, routes, and the listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use parley_sync::SyncEngine;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::api;
use crate::auth::TokenAuthority;
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The sync engine.
    pub engine: Arc<SyncEngine>,
    /// Token issuer and verifier.
    pub auth: Arc<TokenAuthority>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown signal shared by every session.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// One permit per allowed live session.
    pub slots: Arc<Semaphore>,
    /// When the server was built.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The Parley HTTP + `WebSocket` server.
pub struct ParleyServer {
    state: AppState,
}

impl ParleyServer {
    /// Server over `engine`, authenticating with `auth`.
    pub fn new(config: ServerConfig, engine: Arc<SyncEngine>, auth: TokenAuthority) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Self {
            state: AppState {
                engine,
                auth: Arc::new(auth),
                config: Arc::new(config),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                slots,
                start_time: Instant::now(),
                metrics: None,
            },
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        let state = self.state.clone();
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(websocket::ws_handler))
            .nest("/api", api::router(state.clone()))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address and serve in a background task.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task,
    /// which ends once [`shutdown`](Self::shutdown) is signalled and open
    /// requests finish.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.state.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.state.shutdown.token();

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "server stopped with an error");
            }
        });
        info!(%addr, "parley server listening");
        Ok((addr, handle))
    }

    /// Shared state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// The sync engine.
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.state.engine
    }

    /// Token authority.
    pub fn auth(&self) -> &Arc<TokenAuthority> {
        &self.state.auth
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.engine.session_count(),
        state.engine.registry().user_count(),
        state.shutdown.is_shutting_down(),
    ))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
