//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use huddle_hub::Hub;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default time allowed for the listener to drain.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Coordinates shutdown of the listener and the hub.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop accepting new connections.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Shut everything down in order.
    ///
    /// 1. Cancel the token so the listener stops accepting upgrades
    /// 2. Close every live session (writers flush and send Close)
    /// 3. Wait up to `timeout` for the listener tasks, then give up
    pub async fn graceful_shutdown(
        &self,
        hub: &Hub,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        let closed = hub.shutdown().await;
        info!(
            sessions_closed = closed,
            task_count = handles.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for listener to drain"
        );

        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, listener may still be running");
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
