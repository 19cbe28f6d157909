//! Connection registry control loop.
//!
//! One task owns the set of live sessions and the per-user presence counts.
//! Registration, removal, broadcasts and presence queries are commands on an
//! unbounded channel and are applied strictly in arrival order, so a
//! broadcast never observes a half-registered session and a presence query
//! always reflects every command sent before it.
//!
//! Removal is the only place a session's outbound queue is closed, and it is
//! idempotent: whichever of reader failure, writer failure, slow-consumer
//! eviction, heartbeat timeout or shutdown gets there first wins.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use huddle_core::{ConnectionId, PresenceStatus, UserId};
use metrics::{counter, gauge, histogram};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::event::{Event, PresenceScope, StatusChange};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL, WS_EVICTIONS_TOTAL,
};
use crate::presence::{PresenceHandle, PresenceTracker};
use crate::protocol::WireProtocol;
use crate::router::{self, DeliveryReport};
use crate::session::Session;

/// Why a session left the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The client closed the connection.
    ClientClosed,
    /// Reading from the transport failed.
    TransportError,
    /// Writing to the transport failed.
    WriteFailed,
    /// The writer saw its queue closed.
    QueueClosed,
    /// The outbound queue was full.
    SlowConsumer,
    /// No liveness signal within the heartbeat timeout.
    HeartbeatTimeout,
    /// Removed by an upstream caller.
    Requested,
    /// The hub is shutting down.
    Shutdown,
}

impl DisconnectReason {
    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::WriteFailed => "write_failed",
            Self::QueueClosed => "queue_closed",
            Self::SlowConsumer => "slow_consumer",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Requested => "requested",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether the hub, not the peer, ended the session.
    pub fn is_eviction(self) -> bool {
        matches!(self, Self::SlowConsumer | Self::HeartbeatTimeout)
    }
}

enum Command {
    Register {
        session: Arc<Session>,
        reply: oneshot::Sender<bool>,
    },
    Unregister {
        id: ConnectionId,
        reason: DisconnectReason,
        reply: Option<oneshot::Sender<bool>>,
    },
    Broadcast {
        event: Event,
        reply: Option<oneshot::Sender<DeliveryReport>>,
    },
    SetStatus {
        user_id: UserId,
        status: PresenceStatus,
    },
    IsOnline {
        user_id: UserId,
        scope: PresenceScope,
        reply: oneshot::Sender<bool>,
    },
    OnlineUsers {
        scope: PresenceScope,
        reply: oneshot::Sender<BTreeSet<UserId>>,
    },
    SessionCount {
        reply: oneshot::Sender<usize>,
    },
    Contains {
        id: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    Sweep {
        timeout: Duration,
        reply: oneshot::Sender<Vec<ConnectionId>>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable handle to the registry loop.
///
/// Fire-and-forget methods never block. Queries resolve to a default value
/// once the loop has stopped.
#[derive(Clone, Debug)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Register { .. } => "Register",
            Self::Unregister { .. } => "Unregister",
            Self::Broadcast { .. } => "Broadcast",
            Self::SetStatus { .. } => "SetStatus",
            Self::IsOnline { .. } => "IsOnline",
            Self::OnlineUsers { .. } => "OnlineUsers",
            Self::SessionCount { .. } => "SessionCount",
            Self::Contains { .. } => "Contains",
            Self::Sweep { .. } => "Sweep",
            Self::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl RegistryHandle {
    fn send(&self, command: Command) -> bool {
        self.tx.send(command).is_ok()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        if !self.send(command(reply)) {
            return None;
        }
        rx.await.ok()
    }

    /// Add a session. Returns `false` for a duplicate id or a stopped loop.
    pub async fn register(&self, session: Arc<Session>) -> bool {
        self.request(|reply| Command::Register { session, reply })
            .await
            .unwrap_or(false)
    }

    /// Remove a session without waiting. Unknown ids are ignored.
    pub fn unregister(&self, id: &ConnectionId, reason: DisconnectReason) {
        let _ = self.send(Command::Unregister {
            id: id.clone(),
            reason,
            reply: None,
        });
    }

    /// Remove a session. Returns `true` if this call removed it.
    pub async fn unregister_and_wait(&self, id: &ConnectionId, reason: DisconnectReason) -> bool {
        self.request(|reply| Command::Unregister {
            id: id.clone(),
            reason,
            reply: Some(reply),
        })
        .await
        .unwrap_or(false)
    }

    /// Publish an event without waiting.
    pub fn broadcast(&self, event: Event) {
        let _ = self.send(Command::Broadcast { event, reply: None });
    }

    /// Publish an event and wait for the delivery report.
    pub async fn broadcast_and_wait(&self, event: Event) -> DeliveryReport {
        self.request(|reply| Command::Broadcast {
            event,
            reply: Some(reply),
        })
        .await
        .unwrap_or_default()
    }

    /// Set a connected user's status. Ignored for users with no live session.
    pub fn set_status(&self, user_id: UserId, status: PresenceStatus) {
        let _ = self.send(Command::SetStatus { user_id, status });
    }

    /// Whether the user has a live session within `scope`.
    pub async fn is_online(&self, user_id: UserId, scope: PresenceScope) -> bool {
        self.request(|reply| Command::IsOnline {
            user_id,
            scope,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Users with a live session within `scope`.
    pub async fn online_users(&self, scope: PresenceScope) -> BTreeSet<UserId> {
        self.request(|reply| Command::OnlineUsers { scope, reply })
            .await
            .unwrap_or_default()
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.request(|reply| Command::SessionCount { reply })
            .await
            .unwrap_or(0)
    }

    /// Whether a session is registered.
    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.request(|reply| Command::Contains {
            id: id.clone(),
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Evict sessions silent for longer than `timeout`.
    ///
    /// Returns `None` once the loop has stopped.
    pub async fn sweep(&self, timeout: Duration) -> Option<Vec<ConnectionId>> {
        self.request(|reply| Command::Sweep { timeout, reply }).await
    }

    /// Close every session and stop the loop. Returns the number closed.
    pub async fn shutdown(&self) -> usize {
        self.request(|reply| Command::Shutdown { reply })
            .await
            .unwrap_or(0)
    }

    /// Whether the loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the registry loop.
pub fn spawn_registry(presence: PresenceHandle) -> (RegistryHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let registry = Registry::new(rx, presence);
    let task = tokio::spawn(registry.run());
    (RegistryHandle { tx }, task)
}

/// State owned by the registry loop.
struct Registry {
    rx: mpsc::UnboundedReceiver<Command>,
    sessions: HashMap<ConnectionId, Arc<Session>>,
    presence: PresenceTracker,
    writer: PresenceHandle,
    /// Presence events raised while handling a command, delivered before
    /// the next command.
    pending: VecDeque<Event>,
}

impl Registry {
    fn new(rx: mpsc::UnboundedReceiver<Command>, writer: PresenceHandle) -> Self {
        Self {
            rx,
            sessions: HashMap::new(),
            presence: PresenceTracker::new(),
            writer,
            pending: VecDeque::new(),
        }
    }

    async fn run(mut self) {
        debug!("connection registry started");
        while let Some(command) = self.rx.recv().await {
            let keep_running = self.handle(command);
            self.flush_pending();
            if !keep_running {
                break;
            }
        }
        for session in self.sessions.values() {
            let _ = session.close();
        }
        info!(remaining = self.sessions.len(), "connection registry stopped");
    }

    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Register { session, reply } => {
                let _ = reply.send(self.insert(session));
            }
            Command::Unregister { id, reason, reply } => {
                let removed = self.remove(&id, reason);
                if let Some(reply) = reply {
                    let _ = reply.send(removed);
                }
            }
            Command::Broadcast { event, reply } => {
                let report = self.deliver(&event);
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
            }
            Command::SetStatus { user_id, status } => self.set_status(user_id, status),
            Command::IsOnline {
                user_id,
                scope,
                reply,
            } => {
                let online = match scope {
                    PresenceScope::Anywhere => self.presence.is_online(user_id),
                    scope => self
                        .sessions
                        .values()
                        .any(|s| s.user_id() == user_id && scope.includes(s)),
                };
                let _ = reply.send(online);
            }
            Command::OnlineUsers { scope, reply } => {
                let users = match scope {
                    PresenceScope::Anywhere => self.presence.online_users(),
                    scope => self
                        .sessions
                        .values()
                        .filter(|s| scope.includes(s))
                        .map(|s| s.user_id())
                        .collect(),
                };
                let _ = reply.send(users);
            }
            Command::SessionCount { reply } => {
                let _ = reply.send(self.sessions.len());
            }
            Command::Contains { id, reply } => {
                let _ = reply.send(self.sessions.contains_key(&id));
            }
            Command::Sweep { timeout, reply } => {
                let stale: Vec<ConnectionId> = self
                    .sessions
                    .values()
                    .filter(|s| s.idle_for() > timeout)
                    .map(|s| s.id().clone())
                    .collect();
                for id in &stale {
                    let _ = self.remove(id, DisconnectReason::HeartbeatTimeout);
                }
                let _ = reply.send(stale);
            }
            Command::Shutdown { reply } => {
                let ids: Vec<ConnectionId> = self.sessions.keys().cloned().collect();
                for id in &ids {
                    let _ = self.remove(id, DisconnectReason::Shutdown);
                }
                self.pending.clear();
                info!(closed = ids.len(), "registry shutdown");
                let _ = reply.send(ids.len());
                return false;
            }
        }
        true
    }

    fn insert(&mut self, session: Arc<Session>) -> bool {
        if self.sessions.contains_key(session.id()) {
            debug!(conn_id = %session.id(), "duplicate registration ignored");
            return false;
        }
        let user_id = session.user_id();
        let _ = self.sessions.insert(session.id().clone(), session.clone());

        let protocol = match session.protocol() {
            WireProtocol::Board => "board",
            WireProtocol::Ddp => "ddp",
        };
        counter!(WS_CONNECTIONS_TOTAL, "protocol" => protocol).increment(1);
        self.record_active();
        info!(
            conn_id = %session.id(),
            user_id = %user_id,
            scope = ?session.scope(),
            protocol,
            "session registered"
        );

        if self.presence.connected(user_id) {
            self.publish_status(user_id, session.username().map(str::to_owned), PresenceStatus::Online);
        }
        true
    }

    fn remove(&mut self, id: &ConnectionId, reason: DisconnectReason) -> bool {
        let Some(session) = self.sessions.remove(id) else {
            return false;
        };
        let _ = session.close();

        counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
        if reason.is_eviction() {
            counter!(WS_EVICTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
        }
        histogram!(WS_CONNECTION_DURATION_SECONDS).record(session.age().as_secs_f64());
        self.record_active();
        info!(
            conn_id = %id,
            user_id = %session.user_id(),
            reason = reason.as_str(),
            "session unregistered"
        );

        let user_id = session.user_id();
        if self.presence.disconnected(user_id) {
            self.publish_status(user_id, session.username().map(str::to_owned), PresenceStatus::Offline);
        }
        true
    }

    fn set_status(&mut self, user_id: UserId, status: PresenceStatus) {
        if !self.presence.is_online(user_id) {
            debug!(user_id = %user_id, status = status.as_str(), "status change for offline user ignored");
            return;
        }
        let username = self
            .sessions
            .values()
            .find(|s| s.user_id() == user_id)
            .and_then(|s| s.username().map(str::to_owned));
        self.publish_status(user_id, username, status);
    }

    fn publish_status(&mut self, user_id: UserId, username: Option<String>, status: PresenceStatus) {
        self.writer.set_status(user_id, status);
        self.pending.push_back(Event::StatusChanged(StatusChange {
            user_id,
            username,
            status: status.public(),
        }));
    }

    fn deliver(&mut self, event: &Event) -> DeliveryReport {
        let report = router::fan_out(self.sessions.values(), event);
        for id in &report.evicted {
            let _ = self.remove(id, DisconnectReason::SlowConsumer);
        }
        report
    }

    fn flush_pending(&mut self) {
        while let Some(event) = self.pending.pop_front() {
            let _ = self.deliver(&event);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_active(&self) {
        gauge!(WS_CONNECTIONS_ACTIVE).set(self.sessions.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use huddle_core::BoardId;
    use serde_json::json;

    use super::*;
    use crate::presence::PresenceUpdate;
    use crate::session::{Identity, SessionScope};
    use crate::test_support::{Harness, decode_all};

    fn status_updates(harness: &mut Harness) -> Vec<(UserId, PresenceStatus)> {
        let mut updates = Vec::new();
        while let Ok(update) = harness.presence_rx.try_recv() {
            if let PresenceUpdate::Status { user_id, status, .. } = update {
                updates.push((user_id, status));
            }
        }
        updates
    }

    #[tokio::test]
    async fn register_and_unregister_transitions_presence() {
        let mut harness = Harness::new();
        let registry = harness.services.registry.clone();
        let user = UserId::new(1);

        let (a, _a_rx) = harness
            .connect(Identity::new(user), SessionScope::Global, WireProtocol::Board)
            .await;
        let (b, _b_rx) = harness
            .connect(Identity::new(user), SessionScope::Board(BoardId::new(2)), WireProtocol::Board)
            .await;
        assert!(registry.is_online(user, PresenceScope::Anywhere).await);
        assert_eq!(status_updates(&mut harness), vec![(user, PresenceStatus::Online)]);

        assert!(registry.unregister_and_wait(a.id(), DisconnectReason::ClientClosed).await);
        assert!(registry.is_online(user, PresenceScope::Anywhere).await);
        assert!(status_updates(&mut harness).is_empty());

        assert!(registry.unregister_and_wait(b.id(), DisconnectReason::ClientClosed).await);
        assert!(!registry.is_online(user, PresenceScope::Anywhere).await);
        assert_eq!(status_updates(&mut harness), vec![(user, PresenceStatus::Offline)]);
    }

    #[tokio::test]
    async fn unregister_is_idempotent_and_closes_queue() {
        let harness = Harness::new();
        let registry = harness.services.registry.clone();
        let (session, mut rx) = harness
            .connect(Identity::new(UserId::new(1)), SessionScope::Global, WireProtocol::Board)
            .await;
        harness.sync().await;
        let _ = decode_all(&mut rx);

        assert!(registry.unregister_and_wait(session.id(), DisconnectReason::ClientClosed).await);
        assert!(!registry.unregister_and_wait(session.id(), DisconnectReason::WriteFailed).await);
        assert!(session.is_closed());
        assert!(rx.recv().await.is_none());
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn broadcast_skips_sessions_removed_before_it() {
        let harness = Harness::new();
        let registry = harness.services.registry.clone();
        let board = SessionScope::Board(BoardId::new(7));
        let (gone, mut gone_rx) = harness
            .connect(Identity::new(UserId::new(1)), board, WireProtocol::Board)
            .await;
        let (_stays, mut stays_rx) = harness
            .connect(Identity::new(UserId::new(2)), board, WireProtocol::Board)
            .await;
        harness.sync().await;
        let _ = decode_all(&mut gone_rx);

        assert!(registry.unregister_and_wait(gone.id(), DisconnectReason::ClientClosed).await);
        let report = registry
            .broadcast_and_wait(Event::board(BoardId::new(7), "card_moved", json!({"id": 3})))
            .await;

        assert_eq!(report.matched, 1);
        assert_eq!(report.delivered, 1);
        assert!(gone_rx.recv().await.is_none());
        assert!(
            decode_all(&mut stays_rx)
                .iter()
                .any(|frame| frame["type"] == "card_moved")
        );
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let harness = Harness::new();
        let registry = harness.services.registry.clone();
        let (session, _rx) = Session::new(
            Identity::new(UserId::new(1)),
            SessionScope::Global,
            WireProtocol::Board,
            8,
        );
        assert!(registry.register(session.clone()).await);
        assert!(!registry.register(session).await);
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_and_others_see_offline() {
        let harness = Harness::new();
        let registry = harness.services.registry.clone();
        let board = SessionScope::Board(BoardId::new(7));

        let (slow, _slow_rx) = Session::new(Identity::new(UserId::new(1)), board, WireProtocol::Board, 2);
        assert!(registry.register(slow.clone()).await);
        let (_watcher, mut watcher_rx) = harness
            .connect(Identity::new(UserId::new(2)), SessionScope::Global, WireProtocol::Board)
            .await;
        harness.sync().await;
        let _ = decode_all(&mut watcher_rx);

        // Both slots hold the online notices of users 1 and 2.
        let report = registry
            .broadcast_and_wait(Event::board(BoardId::new(7), "tick", json!(1)))
            .await;
        assert_eq!(report.evicted, vec![slow.id().clone()]);
        assert!(slow.is_closed());
        assert!(!registry.contains(slow.id()).await);

        let frames = decode_all(&mut watcher_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "user_status");
        assert_eq!(frames[0]["data"]["status"], "offline");
        assert_eq!(frames[0]["user_id"], 1);
    }

    #[tokio::test]
    async fn set_status_publishes_public_status() {
        let mut harness = Harness::new();
        let registry = harness.services.registry.clone();
        let user = UserId::new(3);
        let (_s, mut rx) = harness
            .connect(Identity::new(user).with_username("cy"), SessionScope::Global, WireProtocol::Board)
            .await;
        harness.sync().await;
        let _ = decode_all(&mut rx);
        let _ = status_updates(&mut harness);

        registry.set_status(user, PresenceStatus::Invisible);
        harness.sync().await;

        assert_eq!(status_updates(&mut harness), vec![(user, PresenceStatus::Invisible)]);
        let frames = decode_all(&mut rx);
        assert_eq!(frames[0]["data"]["status"], "offline");
        assert_eq!(frames[0]["data"]["username"], "cy");
    }

    #[tokio::test]
    async fn set_status_for_offline_user_is_ignored() {
        let mut harness = Harness::new();
        let registry = harness.services.registry.clone();
        registry.set_status(UserId::new(9), PresenceStatus::Away);
        harness.sync().await;
        assert!(status_updates(&mut harness).is_empty());
    }

    #[tokio::test]
    async fn scoped_presence_queries() {
        let harness = Harness::new();
        let registry = harness.services.registry.clone();
        let _ = harness
            .connect(Identity::new(UserId::new(1)), SessionScope::Board(BoardId::new(7)), WireProtocol::Board)
            .await;
        let _ = harness
            .connect(Identity::new(UserId::new(2)), SessionScope::Board(BoardId::new(8)), WireProtocol::Board)
            .await;
        let _ = harness
            .connect(Identity::new(UserId::new(3)), SessionScope::Global, WireProtocol::Ddp)
            .await;

        assert!(registry.is_online(UserId::new(1), PresenceScope::Board(BoardId::new(7))).await);
        assert!(!registry.is_online(UserId::new(1), PresenceScope::Board(BoardId::new(8))).await);
        assert!(!registry.is_online(UserId::new(1), PresenceScope::Global).await);
        assert!(registry.is_online(UserId::new(3), PresenceScope::Global).await);

        let on_seven = registry.online_users(PresenceScope::Board(BoardId::new(7))).await;
        assert_eq!(on_seven.into_iter().collect::<Vec<_>>(), vec![UserId::new(1)]);
        let everyone = registry.online_users(PresenceScope::Anywhere).await;
        assert_eq!(everyone.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_only_idle_sessions() {
        let harness = Harness::new();
        let registry = harness.services.registry.clone();
        let (idle, _idle_rx) = harness
            .connect(Identity::new(UserId::new(1)), SessionScope::Global, WireProtocol::Board)
            .await;
        let (chatty, _chatty_rx) = harness
            .connect(Identity::new(UserId::new(2)), SessionScope::Global, WireProtocol::Board)
            .await;

        tokio::time::advance(Duration::from_secs(60)).await;
        chatty.mark_alive();
        tokio::time::advance(Duration::from_secs(40)).await;

        let evicted = registry.sweep(Duration::from_secs(90)).await.unwrap();
        assert_eq!(evicted, vec![idle.id().clone()]);
        assert!(idle.is_closed());
        assert!(registry.contains(chatty.id()).await);
    }

    #[tokio::test]
    async fn shutdown_closes_everything_and_stops() {
        let harness = Harness::new();
        let registry = harness.services.registry.clone();
        let (a, mut a_rx) = harness
            .connect(Identity::new(UserId::new(1)), SessionScope::Global, WireProtocol::Board)
            .await;
        let (b, _b_rx) = harness
            .connect(Identity::new(UserId::new(2)), SessionScope::Global, WireProtocol::Ddp)
            .await;

        assert_eq!(registry.shutdown().await, 2);
        assert!(a.is_closed());
        assert!(b.is_closed());
        let _ = decode_all(&mut a_rx);
        assert!(a_rx.recv().await.is_none());

        // Queries after shutdown resolve to defaults
        assert_eq!(registry.session_count().await, 0);
        assert!(registry.sweep(Duration::from_secs(1)).await.is_none());
        let (late, _late_rx) = Session::new(
            Identity::new(UserId::new(3)),
            SessionScope::Global,
            WireProtocol::Board,
            8,
        );
        assert!(!registry.register(late).await);
    }

    #[test]
    fn reason_labels() {
        assert_eq!(DisconnectReason::SlowConsumer.as_str(), "slow_consumer");
        assert!(DisconnectReason::HeartbeatTimeout.is_eviction());
        assert!(!DisconnectReason::ClientClosed.is_eviction());
    }
}
