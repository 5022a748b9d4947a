//! Metric names recorded by the engine. The recorder is installed by the server.

/// Live sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "parley_sessions_active";
/// Inbound events handled (counter, labels: kind).
pub const EVENTS_RECEIVED_TOTAL: &str = "parley_events_received_total";
/// Inbound events rejected (counter, labels: kind, code).
pub const EVENTS_REJECTED_TOTAL: &str = "parley_events_rejected_total";
/// Frames queued to sessions (counter, labels: event).
pub const DELIVERIES_TOTAL: &str = "parley_deliveries_total";
/// Frames that could not be queued (counter, labels: event).
pub const DELIVERY_FAILURES_TOTAL: &str = "parley_delivery_failures_total";
/// Store operations that failed (counter, labels: kind).
pub const STORE_FAILURES_TOTAL: &str = "parley_store_failures_total";
/// Presence notifications settled (counter, labels: state).
pub const PRESENCE_TRANSITIONS_TOTAL: &str = "parley_presence_transitions_total";
/// Call invitations that hit their deadline (counter).
pub const CALLS_EXPIRED_TOTAL: &str = "parley_calls_expired_total";
