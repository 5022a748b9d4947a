//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default bound on how long draining may take.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Signals shutdown to every server task and waits for the tracked ones.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    drain_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Coordinator with the default drain timeout.
    pub fn new() -> Self {
        Self::with_drain_timeout(DEFAULT_DRAIN_TIMEOUT)
    }

    /// Coordinator that waits at most `drain_timeout` for tracked tasks.
    pub fn with_drain_timeout(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            drain_timeout,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// A clone of the root cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Track a task to await during [`drain`](Self::drain).
    pub fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Number of tracked tasks not yet drained.
    pub fn tracked(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Signal shutdown without waiting.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signal shutdown, then wait up to the drain timeout for tracked tasks.
    /// Tasks still running afterwards are aborted.
    pub async fn drain(&self) {
        self.shutdown();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        if handles.is_empty() {
            return;
        }
        info!(
            task_count = handles.len(),
            timeout_ms = u64::try_from(self.drain_timeout.as_millis()).unwrap_or(u64::MAX),
            "draining server tasks"
        );
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drained = futures::future::join_all(handles);
        if tokio::time::timeout(self.drain_timeout, drained).await.is_err() {
            warn!(timeout = ?self.drain_timeout, "drain timed out, aborting remaining tasks");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        let coord = ShutdownCoordinator::default();
        assert!(!coord.is_shutting_down());
        assert_eq!(coord.tracked(), 0);
    }

    #[test]
    fn shutdown_cancels_every_token() {
        let coord = ShutdownCoordinator::new();
        let t1 = coord.token();
        let t2 = coord.token().child_token();
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[tokio::test]
    async fn drain_awaits_cooperative_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        coord.track(tokio::spawn(async move {
            token.cancelled().await;
            let _ = done_tx.send(());
        }));

        coord.drain().await;
        assert!(coord.is_shutting_down());
        assert_eq!(coord.tracked(), 0);
        assert!(done_rx.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_aborts_stragglers() {
        let coord = ShutdownCoordinator::with_drain_timeout(Duration::from_millis(100));
        let (finished_tx, finished_rx) = tokio::sync::oneshot::channel::<()>();
        coord.track(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(300)).await;
            let _ = finished_tx.send(());
        }));

        coord.drain().await;
        // Aborted before the sleep ended, so the sender was dropped unsent.
        assert!(finished_rx.await.is_err());
    }

    #[tokio::test]
    async fn drain_without_tasks_returns_immediately() {
        let coord = ShutdownCoordinator::new();
        coord.drain().await;
        assert!(coord.is_shutting_down());
    }
}
