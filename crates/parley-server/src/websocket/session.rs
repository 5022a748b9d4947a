//! Lifecycle of one live `WebSocket` session, from upgrade to disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use parley_core::model::UserProfile;
use parley_sync::{Session, SyncEngine};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, instrument, warn};

use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::server::AppState;

/// How long the outbound forwarder may take to flush after the session ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Run a live session for an authenticated user.
///
/// 1. Registers the session with the engine (which sends `online_users`)
/// 2. Forwards queued outbound frames and periodic pings to the socket
/// 3. Dispatches inbound text frames and replies with acks
/// 4. Drops the session on close, error, heartbeat timeout, or shutdown
///
/// The connection slot `permit` is held until the session ends.
#[instrument(skip_all, fields(user_id = %user.id, session_id = tracing::field::Empty))]
pub async fn run_ws_session(
    ws: WebSocket,
    user: UserProfile,
    state: AppState,
    permit: OwnedSemaphorePermit,
) {
    let engine = Arc::clone(&state.engine);
    let (session, mut outbound_rx) = engine.connect(user).await;
    let _ = tracing::Span::current().record("session_id", tracing::field::display(session.id()));

    let started = Instant::now();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let (mut ws_tx, mut ws_rx) = ws.split();
    let cancel = state.shutdown.token().child_token();
    let ping_every = state.config.heartbeat_interval();

    let outbound_cancel = cancel.clone();
    let outbound = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_every);
        let _ = ping.tick().await;
        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if ws_tx.send(Message::Text(frame.as_str().to_owned().into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                () = outbound_cancel.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let mut heartbeat = tokio::spawn(run_heartbeat(
        Arc::clone(&session),
        ping_every,
        state.config.heartbeat_timeout(),
        cancel.clone(),
    ));

    let reason = loop {
        tokio::select! {
            inbound = ws_rx.next() => {
                let msg = match inbound {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(error = %e, "socket read failed");
                        break "error";
                    }
                    None => break "eof",
                };
                session.mark_alive();
                match msg {
                    Message::Text(text) => handle_text(&engine, &session, text.as_str()).await,
                    Message::Binary(data) => match std::str::from_utf8(&data) {
                        Ok(text) => handle_text(&engine, &session, text).await,
                        Err(_) => debug!(len = data.len(), "ignoring non-UTF8 binary frame"),
                    },
                    Message::Close(_) => break "close",
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
            result = &mut heartbeat => {
                if matches!(result, Ok(HeartbeatResult::TimedOut)) {
                    warn!("client unresponsive, disconnecting");
                    break "heartbeat";
                }
                break "cancelled";
            }
            () = cancel.cancelled() => break "shutdown",
        }
    };

    cancel.cancel();
    engine.disconnect(session.id());
    if tokio::time::timeout(FLUSH_TIMEOUT, outbound).await.is_err() {
        debug!("outbound forwarder did not finish in time");
    }
    heartbeat.abort();
    drop(permit);

    info!(reason, duration_ms = started.elapsed().as_millis(), "websocket closed");
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}

async fn handle_text(engine: &SyncEngine, session: &Session, text: &str) {
    let Some(ack) = engine.handle_frame(session, text).await else {
        return;
    };
    match ack.to_frame() {
        Ok(frame) => {
            if !session.send(frame) {
                debug!(session_id = %session.id(), "ack dropped, outbound queue full or closed");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize ack"),
    }
}
