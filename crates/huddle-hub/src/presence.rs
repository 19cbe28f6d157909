//! Presence counting and the ordered presence writer.
//!
//! [`PresenceTracker`] lives inside the registry loop and turns session
//! registration into per-user online/offline transitions. Transitions and
//! last-seen refreshes are written to the external [`PresenceStore`] by a
//! single writer task, so writes for one user land in the order they were
//! produced.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use huddle_core::{PresenceStatus, PresenceStore, UserId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Live-session counts per user.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    counts: HashMap<UserId, usize>,
}

impl PresenceTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new session. Returns `true` if the user just came online.
    pub fn connected(&mut self, user_id: UserId) -> bool {
        let count = self.counts.entry(user_id).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Uncount a session. Returns `true` if it was the user's last one.
    pub fn disconnected(&mut self, user_id: UserId) -> bool {
        let Some(count) = self.counts.get_mut(&user_id) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            let _ = self.counts.remove(&user_id);
            true
        } else {
            false
        }
    }

    /// Whether the user has at least one live session.
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.counts.contains_key(&user_id)
    }

    /// Live-session count for one user.
    pub fn session_count(&self, user_id: UserId) -> usize {
        self.counts.get(&user_id).copied().unwrap_or(0)
    }

    /// Every user with at least one live session.
    pub fn online_users(&self) -> BTreeSet<UserId> {
        self.counts.keys().copied().collect()
    }
}

/// A write queued for the presence store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PresenceUpdate {
    /// Persist a status.
    Status {
        /// Affected user.
        user_id: UserId,
        /// New status.
        status: PresenceStatus,
        /// When the transition happened.
        at: DateTime<Utc>,
    },
    /// Refresh last-seen.
    Seen {
        /// Affected user.
        user_id: UserId,
        /// When the liveness signal arrived.
        at: DateTime<Utc>,
    },
}

/// Cloneable sender into the presence writer.
#[derive(Clone, Debug)]
pub struct PresenceHandle {
    tx: mpsc::UnboundedSender<PresenceUpdate>,
}

impl PresenceHandle {
    /// Handle plus the receiving end, for callers that run their own writer.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PresenceUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a status write.
    pub fn set_status(&self, user_id: UserId, status: PresenceStatus) {
        self.send(PresenceUpdate::Status {
            user_id,
            status,
            at: Utc::now(),
        });
    }

    /// Queue a last-seen refresh.
    pub fn touch(&self, user_id: UserId) {
        self.send(PresenceUpdate::Seen {
            user_id,
            at: Utc::now(),
        });
    }

    fn send(&self, update: PresenceUpdate) {
        if self.tx.send(update).is_err() {
            debug!("presence writer stopped, dropping update");
        }
    }
}

/// Spawn the writer task for `store`.
///
/// The task ends once every [`PresenceHandle`] is dropped and the queue is
/// drained.
pub fn spawn_presence_writer(store: Arc<dyn PresenceStore>) -> (PresenceHandle, JoinHandle<()>) {
    let (handle, rx) = PresenceHandle::channel();
    let task = tokio::spawn(run_presence_writer(rx, store));
    (handle, task)
}

/// Apply queued updates to `store` one at a time.
pub async fn run_presence_writer(
    mut rx: mpsc::UnboundedReceiver<PresenceUpdate>,
    store: Arc<dyn PresenceStore>,
) {
    while let Some(update) = rx.recv().await {
        let result = match &update {
            PresenceUpdate::Status {
                user_id,
                status,
                at,
            } => store.set_status(*user_id, *status, *at).await,
            PresenceUpdate::Seen { user_id, at } => store.touch(*user_id, *at).await,
        };
        if let Err(e) = result {
            // Routing state is never rolled back on a failed write.
            warn!(?update, error = %e, "presence write failed");
        }
    }
    debug!("presence writer stopped");
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use huddle_core::{MemoryPresenceStore, StoreError};

    use super::*;

    #[test]
    fn first_and_last_session_transitions() {
        let mut tracker = PresenceTracker::new();
        let user = UserId::new(1);
        assert!(tracker.connected(user));
        assert!(!tracker.connected(user));
        assert_eq!(tracker.session_count(user), 2);
        assert!(!tracker.disconnected(user));
        assert!(tracker.is_online(user));
        assert!(tracker.disconnected(user));
        assert!(!tracker.is_online(user));
        assert_eq!(tracker.session_count(user), 0);
    }

    #[test]
    fn disconnect_of_unknown_user_is_noop() {
        let mut tracker = PresenceTracker::new();
        assert!(!tracker.disconnected(UserId::new(9)));
    }

    #[test]
    fn online_users_sorted() {
        let mut tracker = PresenceTracker::new();
        let _ = tracker.connected(UserId::new(3));
        let _ = tracker.connected(UserId::new(1));
        let users: Vec<_> = tracker.online_users().into_iter().collect();
        assert_eq!(users, vec![UserId::new(1), UserId::new(3)]);
    }

    #[tokio::test]
    async fn writer_applies_updates_in_order() {
        let store = Arc::new(MemoryPresenceStore::new());
        let (handle, task) = spawn_presence_writer(store.clone());
        let user = UserId::new(4);
        handle.set_status(user, PresenceStatus::Online);
        handle.set_status(user, PresenceStatus::Away);
        handle.touch(user);
        handle.set_status(user, PresenceStatus::Offline);
        drop(handle);
        task.await.unwrap();

        let record = store.get(user).unwrap();
        assert_eq!(record.status, PresenceStatus::Offline);
    }

    struct BrokenStore;

    #[async_trait]
    impl PresenceStore for BrokenStore {
        async fn set_status(
            &self,
            _user_id: UserId,
            _status: PresenceStatus,
            _at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("db down".into()))
        }

        async fn touch(&self, _user_id: UserId, _at: DateTime<Utc>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("db down".into()))
        }
    }

    #[tokio::test]
    async fn writer_survives_store_errors() {
        let (handle, task) = spawn_presence_writer(Arc::new(BrokenStore));
        handle.set_status(UserId::new(1), PresenceStatus::Online);
        handle.touch(UserId::new(1));
        drop(handle);
        // Completes instead of panicking
        task.await.unwrap();
    }

    #[test]
    fn handle_without_writer_drops_updates() {
        let (handle, rx) = PresenceHandle::channel();
        drop(rx);
        handle.set_status(UserId::new(1), PresenceStatus::Online);
    }
}
