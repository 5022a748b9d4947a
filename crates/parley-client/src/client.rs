//! [`SyncClient`]: one event stream over whichever transport is available.

use parley_sync::{ClientEvent, ServerEvent};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::errors::{ClientError, Result};
use crate::fallback::PollingChannel;
use crate::live::LiveChannel;
use crate::rest::RestClient;

/// Transport in use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    /// Persistent `WebSocket`.
    Live,
    /// Periodic REST polling.
    Polling,
}

enum Channel {
    Live(LiveChannel),
    Polling(PollingChannel),
}

/// Connected client.
pub struct SyncClient {
    channel: Channel,
    events: mpsc::Receiver<ServerEvent>,
    rest: RestClient,
}

impl SyncClient {
    /// Connect, preferring the live channel.
    ///
    /// A failed `WebSocket` handshake is not an error: the client starts
    /// polling instead. An unusable base URL is.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let base = config.http_base()?;
        let rest = RestClient::new(base, &config.token);
        let (events_tx, events) = mpsc::channel(config.event_buffer.max(1));

        let channel = if config.force_polling {
            Channel::Polling(PollingChannel::start(rest.clone(), config.poll_interval, events_tx))
        } else {
            match LiveChannel::connect(&config, events_tx.clone()).await {
                Ok(live) => Channel::Live(live),
                Err(ClientError::InvalidToken) => return Err(ClientError::InvalidToken),
                Err(e) => {
                    warn!(error = %e, "live channel unavailable, falling back to polling");
                    Channel::Polling(PollingChannel::start(
                        rest.clone(),
                        config.poll_interval,
                        events_tx,
                    ))
                }
            }
        };

        let client = Self {
            channel,
            events,
            rest,
        };
        info!(transport = ?client.transport(), "client connected");
        Ok(client)
    }

    /// Which transport is carrying events.
    pub fn transport(&self) -> Transport {
        match self.channel {
            Channel::Live(_) => Transport::Live,
            Channel::Polling(_) => Transport::Polling,
        }
    }

    /// Whether the transport has stopped delivering events.
    pub fn is_closed(&self) -> bool {
        match &self.channel {
            Channel::Live(live) => live.is_closed(),
            Channel::Polling(polling) => polling.is_closed(),
        }
    }

    /// Next server event; `None` once the transport has ended.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// Next server event if one is already buffered.
    pub fn try_next_event(&mut self) -> Option<ServerEvent> {
        self.events.try_recv().ok()
    }

    /// Send an event and return its result.
    pub async fn send(&self, event: ClientEvent) -> Result<Value> {
        match &self.channel {
            Channel::Live(live) => live.send(&event).await,
            Channel::Polling(polling) => polling.send(&event).await,
        }
    }

    /// REST client sharing this client's credentials, for history and lookups.
    pub fn rest(&self) -> &RestClient {
        &self.rest
    }
}
