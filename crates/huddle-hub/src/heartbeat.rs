//! Heartbeat supervisor.
//!
//! Writers send keepalives on their own schedule; this task only decides when
//! a silent session is dead. Every `interval` it asks the registry to evict
//! sessions whose last liveness signal is older than `timeout`.

use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::RegistryHandle;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatExit {
    /// The supervisor was cancelled externally.
    Cancelled,
    /// The registry loop stopped.
    RegistryClosed,
}

/// Run the supervisor until cancelled or the registry stops.
pub async fn run_heartbeat(
    registry: RegistryHandle,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatExit {
    let mut check_interval = time::interval(interval);
    check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately; nothing can be stale yet.
    check_interval.reset();

    loop {
        tokio::select! {
            _ = check_interval.tick() => {
                let Some(evicted) = registry.sweep(timeout).await else {
                    debug!("registry stopped, heartbeat exiting");
                    return HeartbeatExit::RegistryClosed;
                };
                if !evicted.is_empty() {
                    info!(count = evicted.len(), timeout_secs = timeout.as_secs(), "evicted unresponsive sessions");
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatExit::Cancelled;
            }
        }
    }
}
