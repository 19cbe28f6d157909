//! The hub facade used by the HTTP layer and by upstream services.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, Stream};
use huddle_core::{
    BoardId, ConnectionId, MemoryMessageStore, MemoryPresenceStore, MessageStore, PresenceStatus,
    PresenceStore, UserId,
};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::event::{Event, Notification, PresenceScope, ScopeTarget, TypingNotice};
use crate::heartbeat::run_heartbeat;
use crate::presence::spawn_presence_writer;
use crate::protocol::board::{AllowAll, InboundPolicy};
use crate::protocol::methods::MethodRegistry;
use crate::protocol::{HubServices, ProtocolHandler, WireProtocol, handler_for};
use crate::pump::run_session;
use crate::registry::{DisconnectReason, RegistryHandle, spawn_registry};
use crate::router::DeliveryReport;
use crate::session::{Frame, Identity, Session, SessionScope};

/// Hub tuning.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Capacity of each session's outbound queue.
    pub queue_capacity: usize,
    /// Interval between keepalive frames.
    pub keepalive_interval: Duration,
    /// Interval between heartbeat sweeps.
    pub heartbeat_interval: Duration,
    /// Silence after which a session is evicted.
    pub heartbeat_timeout: Duration,
    /// Rebroadcast inbound board frames to the sender's board.
    pub board_echo: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            keepalive_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            board_echo: true,
        }
    }
}

/// Errors surfaced by the hub facade.
#[derive(Debug, Error)]
pub enum HubError {
    /// The registry loop has stopped.
    #[error("hub is shut down")]
    Closed,
}

/// A session that has been registered but not yet attached to a socket.
pub struct Registered {
    /// The live session.
    pub session: Arc<Session>,
    /// Receiving half of its outbound queue.
    pub outbound: mpsc::Receiver<Frame>,
}

/// Builder for [`Hub`].
pub struct HubBuilder {
    config: HubConfig,
    presence_store: Arc<dyn PresenceStore>,
    message_store: Arc<dyn MessageStore>,
    inbound_policy: Arc<dyn InboundPolicy>,
    methods: MethodRegistry,
}

impl HubBuilder {
    /// Persist presence through `store`.
    #[must_use]
    pub fn presence_store(mut self, store: Arc<dyn PresenceStore>) -> Self {
        self.presence_store = store;
        self
    }

    /// Persist chat messages through `store`.
    #[must_use]
    pub fn message_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.message_store = store;
        self
    }

    /// Authorize inbound board frames with `policy`.
    #[must_use]
    pub fn inbound_policy(mut self, policy: Arc<dyn InboundPolicy>) -> Self {
        self.inbound_policy = policy;
        self
    }

    /// Replace the DDP method table.
    #[must_use]
    pub fn methods(mut self, methods: MethodRegistry) -> Self {
        self.methods = methods;
        self
    }

    /// Spawn the registry loop, presence writer and heartbeat supervisor.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> Hub {
        // Detached; ends once every presence handle is dropped.
        let (presence, _presence_task) = spawn_presence_writer(self.presence_store);
        let (registry, registry_task) = spawn_registry(presence.clone());

        let cancel = CancellationToken::new();
        let heartbeat_task = tokio::spawn({
            let registry = registry.clone();
            let cancel = cancel.clone();
            let interval = self.config.heartbeat_interval;
            let timeout = self.config.heartbeat_timeout;
            async move {
                let exit = run_heartbeat(registry, interval, timeout, cancel).await;
                info!(?exit, "heartbeat supervisor stopped");
            }
        });

        info!(
            queue_capacity = self.config.queue_capacity,
            heartbeat_timeout_secs = self.config.heartbeat_timeout.as_secs(),
            board_echo = self.config.board_echo,
            "hub started"
        );

        Hub {
            services: HubServices {
                registry,
                presence,
                messages: self.message_store,
                methods: Arc::new(self.methods),
                inbound_policy: self.inbound_policy,
                board_echo: self.config.board_echo,
            },
            config: self.config,
            cancel,
            tasks: Mutex::new(vec![registry_task, heartbeat_task]),
        }
    }
}

/// Real-time connection hub.
pub struct Hub {
    services: HubServices,
    config: HubConfig,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Builder with in-memory stores and the default method table.
    pub fn builder(config: HubConfig) -> HubBuilder {
        HubBuilder {
            config,
            presence_store: Arc::new(MemoryPresenceStore::new()),
            message_store: Arc::new(MemoryMessageStore::new()),
            inbound_policy: Arc::new(AllowAll),
            methods: MethodRegistry::with_defaults(),
        }
    }

    /// Configuration the hub was started with.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Registry handle.
    pub fn registry(&self) -> &RegistryHandle {
        &self.services.registry
    }

    /// Shared collaborators handed to protocol handlers.
    pub fn services(&self) -> &HubServices {
        &self.services
    }

    /// Create and register a session.
    pub async fn register(
        &self,
        identity: Identity,
        scope: SessionScope,
        protocol: WireProtocol,
    ) -> Result<Registered, HubError> {
        let (session, outbound) =
            Session::new(identity, scope, protocol, self.config.queue_capacity);
        if self.services.registry.register(session.clone()).await {
            Ok(Registered { session, outbound })
        } else {
            Err(HubError::Closed)
        }
    }

    /// Remove a session. Returns `true` if it was live.
    pub async fn unregister(&self, id: &ConnectionId) -> bool {
        self.services
            .registry
            .unregister_and_wait(id, DisconnectReason::Requested)
            .await
    }

    /// Protocol handler for a registered session.
    pub fn handler_for(&self, session: &Arc<Session>) -> Box<dyn ProtocolHandler> {
        handler_for(session.clone(), self.services.clone())
    }

    /// Run the pumps for a registered session on `socket` until it ends.
    pub async fn serve<S, E>(&self, socket: S, registered: Registered) -> DisconnectReason
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
        E: Display + Send + 'static,
    {
        let Registered { session, outbound } = registered;
        let handler = self.handler_for(&session);
        run_session(
            socket,
            session,
            outbound,
            handler,
            self.services.registry.clone(),
            self.config.keepalive_interval,
        )
        .await
    }

    /// Register a session for `socket` and serve it.
    pub async fn connect<S, E>(
        &self,
        socket: S,
        identity: Identity,
        scope: SessionScope,
        protocol: WireProtocol,
    ) -> Result<DisconnectReason, HubError>
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
        E: Display + Send + 'static,
    {
        let registered = self.register(identity, scope, protocol).await?;
        Ok(self.serve(socket, registered).await)
    }

    /// Publish a server event to every session on a board.
    pub fn broadcast_to_board(&self, board_id: BoardId, event_type: &str, data: Value) {
        self.services
            .registry
            .broadcast(Event::board(board_id, event_type, data));
    }

    /// Publish a private event to every session of `recipient`.
    pub fn broadcast_to_user(&self, recipient: UserId, event_type: &str, data: Value) {
        self.services
            .registry
            .broadcast(Event::private(recipient, event_type, data));
    }

    /// Publish an event to an arbitrary scope.
    pub fn broadcast_to_scope(&self, target: ScopeTarget, event_type: &str, data: Value) {
        self.services.registry.broadcast(Event::Notify(Notification {
            target,
            event_type: event_type.to_owned(),
            user_id: None,
            data,
        }));
    }

    /// Tell `recipient` whether `from` is typing to them.
    pub fn broadcast_typing(&self, recipient: UserId, from: UserId, is_typing: bool) {
        self.services.registry.broadcast(Event::Typing(TypingNotice {
            from,
            recipient,
            is_typing,
        }));
    }

    /// Change a connected user's status and publish it.
    pub fn broadcast_status_change(&self, user_id: UserId, status: PresenceStatus) {
        self.services.registry.set_status(user_id, status);
    }

    /// Publish an event and wait for its delivery report.
    pub async fn publish(&self, event: Event) -> DeliveryReport {
        self.services.registry.broadcast_and_wait(event).await
    }

    /// Whether the user has a live session within `scope`.
    pub async fn is_online(&self, user_id: UserId, scope: PresenceScope) -> bool {
        self.services.registry.is_online(user_id, scope).await
    }

    /// Whether the user has any live session.
    pub async fn is_online_anywhere(&self, user_id: UserId) -> bool {
        self.is_online(user_id, PresenceScope::Anywhere).await
    }

    /// Users with a live session within `scope`.
    pub async fn online_users(&self, scope: PresenceScope) -> BTreeSet<UserId> {
        self.services.registry.online_users(scope).await
    }

    /// Number of live sessions.
    pub async fn connection_count(&self) -> usize {
        self.services.registry.session_count().await
    }

    /// Close every session and stop the registry and heartbeat tasks.
    ///
    /// Writers flush their queues and send a Close frame. The presence
    /// writer finishes once the last handle is dropped.
    pub async fn shutdown(&self) -> usize {
        self.cancel.cancel();
        let closed = self.services.registry.shutdown().await;
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let _ = futures::future::join_all(tasks).await;
        info!(closed, "hub shut down");
        closed
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
