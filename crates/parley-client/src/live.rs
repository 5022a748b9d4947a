//! Live channel: a `WebSocket` connection with request/ack correlation.
//!
//! Outbound events carry a client-generated `id`. The handler loop keeps a
//! pending map from id to a oneshot sender and resolves it when the matching
//! `ack` frame arrives. Every other frame is forwarded to the event channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parley_core::ErrorBody;
use parley_sync::{ClientEvent, ServerEvent};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::errors::{ClientError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type AckTx = oneshot::Sender<Result<Value>>;

struct Outbound {
    frame: String,
    request_id: String,
    ack_tx: AckTx,
}

/// An open live connection.
pub struct LiveChannel {
    cmd_tx: mpsc::Sender<Outbound>,
    next_id: AtomicU64,
    ack_timeout: Duration,
    handler: JoinHandle<()>,
}

impl LiveChannel {
    /// Open the `WebSocket` and start the handler loop.
    ///
    /// Server events that are not acks are sent to `events`.
    pub async fn connect(
        config: &ClientConfig,
        events: mpsc::Sender<ServerEvent>,
    ) -> Result<Self> {
        let mut request = config.ws_url()?.into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|_| ClientError::InvalidToken)?;
        let _ = request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, _) = connect_async(request).await?;
        debug!(url = %config.base_url, "live channel open");

        let (cmd_tx, cmd_rx) = mpsc::channel::<Outbound>(64);
        let handler = tokio::spawn(handler_loop(ws, cmd_rx, events));
        Ok(Self {
            cmd_tx,
            next_id: AtomicU64::new(1),
            ack_timeout: config.ack_timeout,
            handler,
        })
    }

    /// Send one event and wait for its ack.
    ///
    /// Returns the ack's `result`, or [`ClientError::Rejected`] with the
    /// server's error body.
    pub async fn send(&self, event: &ClientEvent) -> Result<Value> {
        let request_id = format!("c{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut value = serde_json::to_value(event)?;
        if let Value::Object(map) = &mut value {
            let _ = map.insert("id".into(), Value::String(request_id.clone()));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Outbound {
                frame: value.to_string(),
                request_id: request_id.clone(),
                ack_tx,
            })
            .await
            .map_err(|_| ClientError::Closed)?;

        tokio::time::timeout(self.ack_timeout, ack_rx)
            .await
            .map_err(|_| ClientError::AckTimeout(request_id))?
            .map_err(|_| ClientError::Closed)?
    }

    /// Whether the connection has ended.
    pub fn is_closed(&self) -> bool {
        self.handler.is_finished()
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

fn ack_outcome(success: bool, result: Option<Value>, error: Option<ErrorBody>) -> Result<Value> {
    if success {
        return Ok(result.unwrap_or(Value::Null));
    }
    Err(ClientError::Rejected(error.unwrap_or_else(|| ErrorBody {
        code: "UNKNOWN".into(),
        message: "request failed".into(),
    })))
}

async fn handler_loop(
    ws: WsStream,
    mut cmd_rx: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<ServerEvent>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut pending: HashMap<String, AckTx> = HashMap::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                };
                let _ = pending.insert(cmd.request_id, cmd.ack_tx);
                if ws_tx.send(Message::Text(cmd.frame.into())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "server closed live channel");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "live channel read failed");
                        break;
                    }
                    None => break,
                };
                let event: ServerEvent = match serde_json::from_str(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "unrecognized server frame");
                        continue;
                    }
                };
                if let ServerEvent::Ack { request_id: Some(id), success, result, error } = event {
                    if let Some(tx) = pending.remove(&id) {
                        let _ = tx.send(ack_outcome(success, result, error));
                    }
                    continue;
                }
                if events.send(event).await.is_err() {
                    break;
                }
            }
        }
    }
    // Dropping `pending` resolves every waiter with `Closed`.
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn successful_ack_returns_result() {
        let value = ack_outcome(true, Some(json!({"id": "m1"})), None).unwrap();
        assert_eq!(value["id"], "m1");
        assert_eq!(ack_outcome(true, None, None).unwrap(), Value::Null);
    }

    #[test]
    fn failed_ack_carries_server_error() {
        let body = ErrorBody {
            code: "UNAUTHORIZED".into(),
            message: "not a member".into(),
        };
        let err = ack_outcome(false, None, Some(body)).unwrap_err();
        assert_eq!(err.code(), Some("UNAUTHORIZED"));
    }

    #[test]
    fn failed_ack_without_body_is_still_rejected() {
        let err = ack_outcome(false, None, None).unwrap_err();
        assert!(matches!(err, ClientError::Rejected(ref b) if b.code == "UNKNOWN"));
    }
}
