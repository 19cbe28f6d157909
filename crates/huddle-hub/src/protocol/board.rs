//! Board envelope protocol.
//!
//! Outbound frames are `{type, board_id?, user_id?, recipient_id?, data}`.
//! Inbound frames on a board session are rebroadcast to the board with the
//! sender's identity stamped by the server. Global sessions only accept
//! private typing indicators.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use huddle_core::{BoardId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{HubServices, ProtocolHandler};
use crate::event::{Event, Notification, ScopeTarget, TypingNotice};
use crate::session::{Session, SessionScope};

/// Event type of private typing indicators.
pub const TYPING_EVENT: &str = "typing";
/// Event type of presence changes on the board wire.
pub const USER_STATUS_EVENT: &str = "user_status";

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    event_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    board_id: Option<BoardId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recipient_id: Option<UserId>,
    data: Cow<'a, Value>,
}

/// Render an event as a board envelope. Chat-room events have no board form.
pub(crate) fn encode_event(event: &Event) -> serde_json::Result<Option<String>> {
    let envelope = match event {
        Event::Notify(notification) => {
            let (board_id, recipient_id) = match &notification.target {
                ScopeTarget::Board(board_id) => (Some(*board_id), None),
                ScopeTarget::User(user_id) => (None, Some(*user_id)),
                ScopeTarget::Room(_) | ScopeTarget::All => (None, None),
            };
            Envelope {
                event_type: &notification.event_type,
                board_id,
                user_id: notification.user_id,
                recipient_id,
                data: Cow::Borrowed(&notification.data),
            }
        }
        Event::Typing(notice) => Envelope {
            event_type: TYPING_EVENT,
            board_id: None,
            user_id: Some(notice.from),
            recipient_id: Some(notice.recipient),
            data: Cow::Owned(json!({
                "user_id": notice.from,
                "is_typing": notice.is_typing,
            })),
        },
        Event::StatusChanged(change) => Envelope {
            event_type: USER_STATUS_EVENT,
            board_id: None,
            user_id: Some(change.user_id),
            recipient_id: None,
            data: Cow::Owned(json!({
                "user_id": change.user_id,
                "username": change.username,
                "status": change.status,
            })),
        },
        Event::RoomMessage(_) | Event::RoomTyping(_) => return Ok(None),
    };
    serde_json::to_string(&envelope).map(Some)
}

/// An inbound board frame. Client-supplied `board_id` and `user_id` are
/// ignored; the server stamps its own.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BoardFrame {
    /// Application event name.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Addressee of private frames.
    #[serde(default)]
    pub recipient_id: Option<UserId>,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

/// Authorization hook consulted before an inbound board frame is rebroadcast.
#[async_trait]
pub trait InboundPolicy: Send + Sync {
    /// Whether `session` may publish `frame` to its board.
    async fn allow(&self, session: &Session, frame: &BoardFrame) -> bool;
}

/// Policy that admits every frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl InboundPolicy for AllowAll {
    async fn allow(&self, _session: &Session, _frame: &BoardFrame) -> bool {
        true
    }
}

/// Handler for board-envelope sessions.
pub struct BoardProtocol {
    session: Arc<Session>,
    services: HubServices,
}

impl BoardProtocol {
    /// Create a handler bound to one session.
    pub fn new(session: Arc<Session>, services: HubServices) -> Self {
        Self { session, services }
    }

    async fn echo(&self, board_id: BoardId, frame: BoardFrame) {
        if !self.services.board_echo {
            debug!(conn_id = %self.session.id(), event_type = %frame.event_type, "board echo disabled, dropping frame");
            return;
        }
        if !self.services.inbound_policy.allow(&self.session, &frame).await {
            warn!(
                conn_id = %self.session.id(),
                user_id = %self.session.user_id(),
                event_type = %frame.event_type,
                "inbound frame rejected by policy"
            );
            return;
        }
        self.services.registry.broadcast(Event::Notify(Notification {
            target: ScopeTarget::Board(board_id),
            event_type: frame.event_type,
            user_id: Some(self.session.user_id()),
            data: frame.data,
        }));
    }

    fn handle_global(&self, frame: BoardFrame) {
        if frame.event_type != TYPING_EVENT {
            debug!(conn_id = %self.session.id(), event_type = %frame.event_type, "ignoring frame on global session");
            return;
        }
        let Some(recipient) = frame.recipient_id else {
            warn!(conn_id = %self.session.id(), "typing frame without recipient_id");
            return;
        };
        let is_typing = frame
            .data
            .get("is_typing")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.services.registry.broadcast(Event::Typing(TypingNotice {
            from: self.session.user_id(),
            recipient,
            is_typing,
        }));
    }
}

#[async_trait]
impl ProtocolHandler for BoardProtocol {
    async fn on_text(&mut self, text: &str) {
        let frame: BoardFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(conn_id = %self.session.id(), error = %e, "discarding malformed board frame");
                return;
            }
        };
        if frame.event_type.is_empty() {
            warn!(conn_id = %self.session.id(), "discarding board frame without type");
            return;
        }
        match self.session.scope() {
            SessionScope::Board(board_id) => self.echo(board_id, frame).await,
            SessionScope::Global => self.handle_global(frame),
        }
    }

    fn on_pong(&mut self) {
        self.services.presence.touch(self.session.user_id());
    }
}
