//! Settings types with compiled defaults.
//!
//! Every section is `#[serde(default)]`, so a settings file only needs the
//! keys it changes.

use std::time::Duration;

use parley_core::constants;
use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleySettings {
    /// Network listener and transport limits.
    pub server: ServerSettings,
    /// Sync engine timing and limits.
    pub sync: SyncSettings,
    /// Persistence.
    pub storage: StorageSettings,
    /// Token authentication.
    pub auth: AuthSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// HTTP/WebSocket listener settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (0 picks a free port).
    pub port: u16,
    /// Maximum concurrent live sessions.
    pub max_connections: usize,
    /// Seconds between server pings.
    pub heartbeat_interval_secs: u64,
    /// Seconds of silence before a client is dropped.
    pub heartbeat_timeout_secs: u64,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per session before deliveries fail.
    pub send_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            max_connections: 1024,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            max_message_size: 64 * 1024,
            send_queue_capacity: 256,
        }
    }
}

/// Sync engine settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Typing inactivity window.
    pub typing_window_ms: u64,
    /// Call invitation response window.
    pub call_response_window_secs: u64,
    /// Presence debounce window.
    pub presence_debounce_ms: u64,
    /// Maximum message length in characters.
    pub max_content_length: usize,
    /// Client polling interval when the live channel is down.
    pub poll_interval_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            typing_window_ms: duration_ms(constants::TYPING_WINDOW),
            call_response_window_secs: constants::CALL_RESPONSE_WINDOW.as_secs(),
            presence_debounce_ms: duration_ms(constants::PRESENCE_DEBOUNCE),
            max_content_length: constants::MAX_CONTENT_LENGTH,
            poll_interval_secs: constants::POLL_INTERVAL.as_secs(),
        }
    }
}

impl SyncSettings {
    /// Typing window as a [`Duration`].
    pub fn typing_window(&self) -> Duration {
        Duration::from_millis(self.typing_window_ms)
    }

    /// Call response window as a [`Duration`].
    pub fn call_response_window(&self) -> Duration {
        Duration::from_secs(self.call_response_window_secs)
    }

    /// Presence debounce as a [`Duration`].
    pub fn presence_debounce(&self) -> Duration {
        Duration::from_millis(self.presence_debounce_ms)
    }

    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Persistence settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Database file. `None` or `":memory:"` keeps everything in memory.
    pub db_path: Option<String>,
    /// Connection pool size.
    pub pool_size: u32,
    /// `SQLite` busy timeout.
    pub busy_timeout_ms: u32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            db_path: Some(format!("{home}/.parley/parley.db")),
            pool_size: 8,
            busy_timeout_ms: 5_000,
        }
    }
}

impl StorageSettings {
    /// Whether the configured database lives only in memory.
    pub fn is_in_memory(&self) -> bool {
        self.db_path
            .as_deref()
            .is_none_or(|p| p.is_empty() || p == ":memory:")
    }
}

/// Token authentication settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// HMAC secret for signing session tokens.
    pub token_secret: String,
    /// Token lifetime in seconds.
    pub token_ttl_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            token_secret: "change-me".into(),
            token_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Compact,
        }
    }
}
