//! # parley-logging
//!
//! Structured logging with `tracing`.
//!
//! Log context (session ID, user ID, conversation ID) travels as span and
//! event fields, so the same call sites produce readable terminal output or
//! machine-parseable JSON lines depending on [`Format`].

#![deny(unsafe_code)]

use tracing_subscriber::EnvFilter;

/// Output format for the global subscriber.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    /// Human-readable single-line output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Build the filter: `RUST_LOG` wins, otherwise `level`.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the global tracing subscriber writing to stderr.
///
/// Call once at application startup. Subsequent calls are no-ops.
pub fn init_subscriber(level: &str, format: Format) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(true)
        .with_writer(std::io::stderr);

    // try_init fails only when a global subscriber is already set
    let _ = match format {
        Format::Compact => builder.compact().try_init(),
        Format::Json => builder.json().flatten_event(true).try_init(),
    };
}
