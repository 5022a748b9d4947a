//! Ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use parley_sync::Session;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The peer stayed silent past the timeout.
    TimedOut,
    /// The session ended for another reason.
    Cancelled,
}

/// Watch a session's liveness flag.
///
/// Every `interval` the flag set by inbound pongs and frames is read and
/// cleared. After `timeout / interval` consecutive silent ticks (at least
/// one) the session is considered dead.
pub async fn run_heartbeat(
    session: Arc<Session>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let max_missed = max_missed(interval, timeout);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if session.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
    }
}

fn max_missed(interval: Duration, timeout: Duration) -> u32 {
    let ticks = timeout.as_millis() / interval.as_millis().max(1);
    u32::try_from(ticks).unwrap_or(u32::MAX).max(1)
}
