//! Server-wide stop signal and the set of tasks that must drain on it.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// How long tracked tasks get to finish before they are abandoned.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Root cancellation token plus a tracker of the listener, the session
/// sweeper, and anything else spawned through [`spawn`](Self::spawn).
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// A child token, cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn `task` so that [`drain`](Self::drain) waits for it.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn(task)
    }

    /// Tracked tasks still running.
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Signal shutdown and wait up to `timeout` for tracked tasks.
    /// Returns `false` if some were still running when time ran out.
    pub async fn drain(&self, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.token.cancel();
        let _ = self.tasks.close();
        info!(running = self.tasks.len(), ?timeout, "draining background tasks");
        let drained = tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok();
        if !drained {
            warn!(running = self.tasks.len(), "drain timed out, abandoning remaining tasks");
        }
        drained
    }
}
