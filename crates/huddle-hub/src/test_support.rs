//! Shared fixtures for unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use huddle_core::{MemoryMessageStore, MessageStore, NewRoomMessage, RoomMessage, StoreError};
use tokio::sync::mpsc;

use crate::presence::{PresenceHandle, PresenceUpdate};
use crate::protocol::board::AllowAll;
use crate::protocol::methods::MethodRegistry;
use crate::protocol::{HubServices, WireProtocol};
use crate::registry::spawn_registry;
use crate::session::{Frame, Identity, Session, SessionScope};

pub(crate) const TEST_QUEUE_CAPACITY: usize = 64;

/// A running registry with observable presence writes.
pub(crate) struct Harness {
    pub services: HubServices,
    pub presence_rx: mpsc::UnboundedReceiver<PresenceUpdate>,
    pub messages: Arc<MemoryMessageStore>,
}

impl Harness {
    pub fn new() -> Self {
        let (presence, presence_rx) = PresenceHandle::channel();
        let (registry, _task) = spawn_registry(presence.clone());
        let messages = Arc::new(MemoryMessageStore::new());
        let services = HubServices {
            registry,
            presence,
            messages: messages.clone(),
            methods: Arc::new(MethodRegistry::with_defaults()),
            inbound_policy: Arc::new(AllowAll),
            board_echo: true,
        };
        Self {
            services,
            presence_rx,
            messages,
        }
    }

    /// Create and register a session.
    pub async fn connect(
        &self,
        identity: Identity,
        scope: SessionScope,
        protocol: WireProtocol,
    ) -> (Arc<Session>, mpsc::Receiver<Frame>) {
        let (session, rx) = Session::new(identity, scope, protocol, TEST_QUEUE_CAPACITY);
        assert!(self.services.registry.register(session.clone()).await);
        (session, rx)
    }

    /// Wait until every command sent so far has been applied.
    pub async fn sync(&self) {
        let _ = self.services.registry.session_count().await;
    }
}

/// Drain every queued frame and parse it as JSON.
pub(crate) fn decode_all(rx: &mut mpsc::Receiver<Frame>) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::from_str(frame.as_str()).unwrap());
    }
    frames
}

/// Message store whose writes always fail.
pub(crate) struct FailingMessageStore;

#[async_trait]
impl MessageStore for FailingMessageStore {
    async fn save_room_message(&self, _message: NewRoomMessage) -> Result<RoomMessage, StoreError> {
        Err(StoreError::Write("disk full".into()))
    }
}
