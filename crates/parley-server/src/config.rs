//! Server configuration.

use std::time::Duration;

use parley_settings::{ParleySettings, ServerSettings};
use parley_sync::SyncConfig;
use serde::{Deserialize, Serialize};

/// Configuration for the Parley server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent live sessions.
    pub max_connections: usize,
    /// Seconds between server pings.
    pub heartbeat_interval_secs: u64,
    /// Seconds of silence after which a session is dropped.
    pub heartbeat_timeout_secs: u64,
    /// Max inbound `WebSocket` message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1024,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            max_message_size: 64 * 1024,
        }
    }
}

impl ServerConfig {
    /// Build from the `server` settings section.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            max_connections: settings.max_connections,
            heartbeat_interval_secs: settings.heartbeat_interval_secs,
            heartbeat_timeout_secs: settings.heartbeat_timeout_secs,
            max_message_size: settings.max_message_size,
        }
    }

    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Ping interval, at least one second.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Silence tolerated before a session is dropped, never shorter than
    /// one ping interval.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs).max(self.heartbeat_interval())
    }
}

/// Engine knobs from the `sync` section plus the server's queue size.
pub fn sync_config(settings: &ParleySettings) -> SyncConfig {
    SyncConfig {
        typing_window: settings.sync.typing_window(),
        call_response_window: settings.sync.call_response_window(),
        presence_debounce: settings.sync.presence_debounce(),
        max_content_length: settings.sync.max_content_length,
        send_queue_capacity: settings.server.send_queue_capacity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_zero() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn from_settings_copies_server_section() {
        let settings = ServerSettings {
            host: "0.0.0.0".into(),
            port: 9000,
            max_connections: 3,
            ..ServerSettings::default()
        };
        let cfg = ServerConfig::from_settings(&settings);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:9000");
        assert_eq!(cfg.max_connections, 3);
        assert_eq!(cfg.max_message_size, settings.max_message_size);
    }

    #[test]
    fn heartbeat_durations_are_clamped() {
        let cfg = ServerConfig {
            heartbeat_interval_secs: 0,
            heartbeat_timeout_secs: 0,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn sync_config_follows_settings() {
        let mut settings = ParleySettings::default();
        settings.sync.typing_window_ms = 500;
        settings.sync.presence_debounce_ms = 10;
        settings.server.send_queue_capacity = 8;
        let sync = sync_config(&settings);
        assert_eq!(sync.typing_window, Duration::from_millis(500));
        assert_eq!(sync.presence_debounce, Duration::from_millis(10));
        assert_eq!(sync.send_queue_capacity, 8);
    }

    #[test]
    fn serde_roundtrip_keeps_fields() {
        let cfg = ServerConfig {
            port: 8080,
            ..ServerConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, 8080);
        assert_eq!(back.max_connections, cfg.max_connections);
    }
}
