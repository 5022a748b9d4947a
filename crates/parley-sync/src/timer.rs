//! Cancellable one-shot timers.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Handle to a scheduled callback. Dropping or cancelling it before the
/// delay elapses prevents the callback from running.
///
/// A callback that has already started is not interrupted; callers that
/// replace a timer guard their callback with a generation check.
#[must_use = "dropping a Timer cancels it"]
#[derive(Debug)]
pub struct Timer {
    token: CancellationToken,
}

impl Timer {
    /// Cancel the timer.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the timer was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Run `callback` after `delay` unless the returned [`Timer`] is cancelled first.
pub fn schedule<F>(delay: Duration, callback: F) -> Timer
where
    F: Future<Output = ()> + Send + 'static,
{
    let token = CancellationToken::new();
    let cancelled = token.clone();
    drop(tokio::spawn(async move {
        tokio::select! {
            () = cancelled.cancelled() => {}
            () = tokio::time::sleep(delay) => callback.await,
        }
    }));
    Timer { token }
}
