//! Client configuration.

use std::time::Duration;

use parley_core::constants::POLL_INTERVAL;

use crate::errors::{ClientError, Result};

/// How long a live request waits for its ack by default.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and how to connect.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Server base URL, e.g. `http://127.0.0.1:8080`.
    pub base_url: String,
    /// Bearer token for the user.
    pub token: String,
    /// Delay between polls when the live channel is unavailable.
    pub poll_interval: Duration,
    /// How long a live request waits for its ack.
    pub ack_timeout: Duration,
    /// Events buffered before the channel applies backpressure.
    pub event_buffer: usize,
    /// Skip the live channel and poll from the start.
    pub force_polling: bool,
}

impl ClientConfig {
    /// Defaults for `base_url` and `token`.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            poll_interval: POLL_INTERVAL,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            event_buffer: 256,
            force_polling: false,
        }
    }

    /// Base URL without a trailing slash.
    pub fn http_base(&self) -> Result<&str> {
        let base = self.base_url.trim_end_matches('/');
        if base.starts_with("http://") || base.starts_with("https://") {
            Ok(base)
        } else {
            Err(ClientError::InvalidUrl(self.base_url.clone()))
        }
    }

    /// The `/ws` endpoint on the same host.
    pub fn ws_url(&self) -> Result<String> {
        let base = self.http_base()?;
        let ws = match base.strip_prefix("https://") {
            Some(rest) => format!("wss://{rest}"),
            None => format!("ws://{}", base.trim_start_matches("http://")),
        };
        Ok(format!("{ws}/ws"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_follows_scheme() {
        let plain = ClientConfig::new("http://localhost:8080/", "t");
        assert_eq!(plain.ws_url().unwrap(), "ws://localhost:8080/ws");
        let tls = ClientConfig::new("https://chat.example.com", "t");
        assert_eq!(tls.ws_url().unwrap(), "wss://chat.example.com/ws");
    }

    #[test]
    fn rejects_other_schemes() {
        let bad = ClientConfig::new("ftp://host", "t");
        assert!(matches!(bad.ws_url(), Err(ClientError::InvalidUrl(_))));
        assert!(matches!(bad.http_base(), Err(ClientError::InvalidUrl(_))));
    }

    #[test]
    fn defaults() {
        let cfg = ClientConfig::new("http://h", "t");
        assert_eq!(cfg.poll_interval, POLL_INTERVAL);
        assert_eq!(cfg.ack_timeout, DEFAULT_ACK_TIMEOUT);
        assert!(!cfg.force_polling);
    }
}
