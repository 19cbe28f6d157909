//! Wire protocols spoken over a session.
//!
//! - [`board`]: the board envelope `{type, board_id, user_id, recipient_id, data}`
//! - [`ddp`]: the DDP-style chat protocol (`connect`, `sub`, `method`, ...)
//!
//! A [`WireProtocol`] renders hub events for its clients; a
//! [`ProtocolHandler`] interprets inbound frames for one session.

pub mod board;
pub mod ddp;
pub mod methods;

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::Message;
use huddle_core::MessageStore;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::event::Event;
use crate::presence::PresenceHandle;
use crate::registry::{DisconnectReason, RegistryHandle};
use crate::session::{Frame, SendOutcome, Session};

use board::{BoardProtocol, InboundPolicy};
use ddp::DdpProtocol;
use methods::MethodRegistry;

/// Wire protocol of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProtocol {
    /// Board envelope protocol.
    Board,
    /// DDP-style chat protocol.
    Ddp,
}

impl WireProtocol {
    /// Render an event for this protocol.
    ///
    /// Returns `None` when the protocol has no representation for the event.
    pub fn encode(self, event: &Event) -> Option<Frame> {
        let rendered = match self {
            Self::Board => board::encode_event(event),
            Self::Ddp => ddp::encode_event(event),
        };
        match rendered {
            Ok(Some(json)) => Some(Frame::from(json)),
            Ok(None) => None,
            Err(e) => {
                warn!(protocol = ?self, kind = event.kind(), error = %e, "failed to serialize event");
                None
            }
        }
    }

    /// Keepalive frame sent by the writer at every keepalive tick.
    pub fn keepalive(self) -> Message {
        match self {
            Self::Board => Message::Ping(Vec::new().into()),
            Self::Ddp => Message::Text(String::from(ddp::PING_FRAME).into()),
        }
    }
}

/// Shared collaborators available to every protocol handler.
#[derive(Clone)]
pub struct HubServices {
    /// Control loop handle.
    pub registry: RegistryHandle,
    /// Ordered presence writer.
    pub presence: PresenceHandle,
    /// Chat message persistence.
    pub messages: Arc<dyn MessageStore>,
    /// DDP method table.
    pub methods: Arc<MethodRegistry>,
    /// Authorization hook for inbound board frames.
    pub inbound_policy: Arc<dyn InboundPolicy>,
    /// Rebroadcast inbound board frames to the sender's board.
    pub board_echo: bool,
}

/// Interprets inbound frames for one session.
///
/// Handlers run on the session's reader task, so frames from one client are
/// processed strictly in arrival order.
#[async_trait]
pub trait ProtocolHandler: Send {
    /// Called once the session is registered, before any frame is read.
    fn on_registered(&mut self) {}

    /// Handle one inbound text frame.
    async fn on_text(&mut self, text: &str);

    /// A transport-level pong (or ping) arrived.
    fn on_pong(&mut self) {}

    /// The reader stopped. No further frames will be delivered.
    fn on_closed(&mut self) {}
}

/// Build the handler for a session's protocol.
pub fn handler_for(session: Arc<Session>, services: HubServices) -> Box<dyn ProtocolHandler> {
    match session.protocol() {
        WireProtocol::Board => Box::new(BoardProtocol::new(session, services)),
        WireProtocol::Ddp => Box::new(DdpProtocol::new(session, services)),
    }
}

/// Enqueue a direct reply to one session.
///
/// A full queue evicts the session through the registry, the same as a
/// broadcast would.
pub(crate) fn reply(session: &Session, registry: &RegistryHandle, frame: Frame) -> bool {
    match session.try_send(frame) {
        SendOutcome::Queued => true,
        SendOutcome::Full => {
            warn!(conn_id = %session.id(), "outbound queue full on direct reply");
            registry.unregister(session.id(), DisconnectReason::SlowConsumer);
            false
        }
        SendOutcome::Closed => false,
    }
}
