//! Per-connection session state.
//!
//! A [`Session`] is created by [`Session::new`] together with the receiving
//! half of its bounded outbound queue. The registry holds the session while
//! it is live; the writer pump drains the receiver. Closing the session drops
//! the only sender, which ends the writer once the queue is drained.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use huddle_core::{BoardId, ConnectionId, RoomId, UserId};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::protocol::WireProtocol;

/// A serialized outbound frame. Clones share one buffer, so every recipient
/// of a broadcast gets the same bytes.
pub type Frame = Utf8Bytes;

/// Authenticated identity attached to a session at registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Authenticated user.
    pub user_id: UserId,
    /// Display name, when the authentication layer provides one.
    pub username: Option<String>,
}

impl Identity {
    /// Identity without a display name.
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            username: None,
        }
    }

    /// Attach a display name.
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Display name, falling back to the numeric user id.
    pub fn display_name(&self) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| self.user_id.to_string())
    }
}

/// Where a session is attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionScope {
    /// Bound to one board. Receives that board's broadcasts.
    Board(BoardId),
    /// Not bound to any board (private-message and chat sessions).
    Global,
}

/// Result of a non-blocking enqueue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The frame is queued for the writer.
    Queued,
    /// The queue is at capacity; the consumer is too slow.
    Full,
    /// The session has been closed.
    Closed,
}

/// One live connection.
pub struct Session {
    id: ConnectionId,
    identity: Identity,
    scope: SessionScope,
    protocol: WireProtocol,
    /// Sender into the outbound queue; `None` once closed.
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    /// Chat rooms this session is subscribed to.
    rooms: RwLock<HashSet<RoomId>>,
    /// Last time the peer proved it was alive.
    last_liveness: Mutex<Instant>,
    connected_at: Instant,
    dropped: AtomicU64,
}

impl Session {
    /// Create a session and the receiving half of its outbound queue.
    pub fn new(
        identity: Identity,
        scope: SessionScope,
        protocol: WireProtocol,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let now = Instant::now();
        let session = Arc::new(Self {
            id: ConnectionId::new(),
            identity,
            scope,
            protocol,
            outbound: Mutex::new(Some(tx)),
            rooms: RwLock::new(HashSet::new()),
            last_liveness: Mutex::new(now),
            connected_at: now,
            dropped: AtomicU64::new(0),
        });
        (session, rx)
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Authenticated identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Authenticated user.
    pub fn user_id(&self) -> UserId {
        self.identity.user_id
    }

    /// Display name, when known.
    pub fn username(&self) -> Option<&str> {
        self.identity.username.as_deref()
    }

    /// Board or global attachment.
    pub fn scope(&self) -> SessionScope {
        self.scope
    }

    /// Board id for board-scoped sessions.
    pub fn board_id(&self) -> Option<BoardId> {
        match self.scope {
            SessionScope::Board(board_id) => Some(board_id),
            SessionScope::Global => None,
        }
    }

    /// Wire protocol spoken on this connection.
    pub fn protocol(&self) -> WireProtocol {
        self.protocol
    }

    /// Enqueue a frame without blocking.
    pub fn try_send(&self, frame: Frame) -> SendOutcome {
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return SendOutcome::Closed;
        };
        match tx.try_send(frame) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Close the outbound queue. Returns `true` on the first call only.
    pub fn close(&self) -> bool {
        self.outbound.lock().take().is_some()
    }

    /// Whether [`Session::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }

    /// Record a liveness signal from the peer.
    pub fn mark_alive(&self) {
        *self.last_liveness.lock() = Instant::now();
    }

    /// Time since the last liveness signal (or since connecting).
    pub fn idle_for(&self) -> Duration {
        self.last_liveness.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Frames dropped because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether the session is subscribed to `room`.
    pub fn in_room(&self, room: &RoomId) -> bool {
        self.rooms.read().contains(room)
    }

    /// Snapshot of subscribed rooms.
    pub fn rooms(&self) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self.rooms.read().iter().cloned().collect();
        rooms.sort();
        rooms
    }

    // Room membership is only mutated by the session's own protocol handler.

    pub(crate) fn join_room(&self, room: RoomId) -> bool {
        self.rooms.write().insert(room)
    }

    pub(crate) fn leave_room(&self, room: &RoomId) -> bool {
        self.rooms.write().remove(room)
    }

    pub(crate) fn clear_rooms(&self) -> usize {
        let mut rooms = self.rooms.write();
        let count = rooms.len();
        rooms.clear();
        count
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.identity.user_id)
            .field("scope", &self.scope)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}
