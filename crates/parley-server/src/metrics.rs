//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Returns the handle used to render `/metrics`. Fails if a recorder is
/// already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from a recorder handle.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants for the HTTP and WebSocket layer. Engine metrics
// live in `parley_sync::metrics`.

/// WebSocket sessions opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "parley_ws_connections_total";
/// WebSocket sessions closed (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "parley_ws_disconnections_total";
/// WebSocket sessions open right now (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "parley_ws_connections_active";
/// Upgrades refused before a session started (counter, labels: reason).
pub const WS_REJECTED_TOTAL: &str = "parley_ws_rejected_total";
/// Lifetime of a WebSocket session (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "parley_ws_connection_duration_seconds";
/// Error responses from HTTP handlers (counter, labels: code).
pub const API_ERRORS_TOTAL: &str = "parley_api_errors_total";
