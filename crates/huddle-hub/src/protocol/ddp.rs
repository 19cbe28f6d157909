//! DDP-style chat protocol.
//!
//! Message kinds handled:
//!
//! | inbound   | outbound                                  |
//! |-----------|-------------------------------------------|
//! | `connect` | `connected {session}`                     |
//! | `sub`     | `ready {subs}` or `nosub {id, error}`     |
//! | `unsub`   | `nosub {id}`                              |
//! | `method`  | `result {id, result}` or `result {id, error}` |
//! | `ping`    | `pong {id}`                               |
//! | `pong`    | liveness only                             |
//!
//! Hub events arrive as `changed` messages on the `stream-*` collections.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use huddle_core::{MessageId, RoomId};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::methods::MethodContext;
use super::{HubServices, ProtocolHandler, reply};
use crate::event::{Event, ScopeTarget};
use crate::session::{Frame, Session};

/// Keepalive sent by the writer.
pub const PING_FRAME: &str = r#"{"msg":"ping"}"#;

/// Room message stream.
pub const STREAM_ROOM_MESSAGES: &str = "stream-room-messages";
/// Per-room notification stream (typing, custom room events).
pub const STREAM_NOTIFY_ROOM: &str = "stream-notify-room";
/// Per-user notification stream (private messages, private typing).
pub const STREAM_NOTIFY_USER: &str = "stream-notify-user";
/// Global notification stream (presence).
pub const STREAM_NOTIFY_ALL: &str = "stream-notify-all";
/// Event name of presence changes on [`STREAM_NOTIFY_ALL`].
pub const STATUS_CHANGED_EVENT: &str = "user.statusChanged";

/// Error object carried by `result` and `nosub`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdpError {
    /// Numeric error code.
    pub error: u16,
    /// Machine-readable reason.
    pub reason: String,
    /// Human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DdpError {
    /// Error with a code and reason.
    pub fn new(error: u16, reason: impl Into<String>) -> Self {
        Self {
            error,
            reason: reason.into(),
            message: None,
        }
    }

    /// Attach a human-readable message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// One DDP message, inbound or outbound.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DdpMessage {
    /// Message kind.
    pub msg: String,
    /// Correlation id (subscription, method call or ping).
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_id"
    )]
    pub id: Option<String>,
    /// Subscription name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Method name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Positional parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Method result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Method or subscription error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DdpError>,
    /// Collection of a `changed` message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Fields of a `changed` message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    /// Session id of a `connected` message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// Subscription ids of a `ready` message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subs: Option<Vec<String>>,
    /// Human-readable reason of an `error` message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// Clients send ids as strings or numbers.
fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

impl DdpMessage {
    fn kind(msg: &str) -> Self {
        Self {
            msg: msg.to_owned(),
            ..Self::default()
        }
    }

    /// `connected` acknowledgement.
    pub fn connected(session: impl Into<String>) -> Self {
        Self {
            session: Some(session.into()),
            ..Self::kind("connected")
        }
    }

    /// `ready` for one subscription.
    pub fn ready(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            id: Some(id.clone()),
            subs: Some(vec![id]),
            ..Self::kind("ready")
        }
    }

    /// `nosub`, optionally with an error.
    pub fn nosub(id: Option<String>, error: Option<DdpError>) -> Self {
        Self {
            id,
            error,
            ..Self::kind("nosub")
        }
    }

    /// Successful method `result`.
    pub fn result(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: Some(id.into()),
            result: Some(result),
            ..Self::kind("result")
        }
    }

    /// Failed method `result`.
    pub fn result_error(id: impl Into<String>, error: DdpError) -> Self {
        Self {
            id: Some(id.into()),
            error: Some(error),
            ..Self::kind("result")
        }
    }

    /// `pong`, echoing the ping id.
    pub fn pong(id: Option<String>) -> Self {
        Self {
            id,
            ..Self::kind("pong")
        }
    }

    /// Protocol-level `error`.
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::kind("error")
        }
    }

    /// `changed` document on a stream collection.
    pub fn changed(collection: &str, fields: Value) -> Self {
        Self {
            id: Some(MessageId::generate().into_inner()),
            collection: Some(collection.to_owned()),
            fields: Some(fields),
            ..Self::kind("changed")
        }
    }

    /// Positional params as a list. A scalar param is a one-element list.
    pub fn params(&self) -> Vec<Value> {
        match &self.params {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
        }
    }
}

fn is_stream_name(name: &str) -> bool {
    matches!(
        name,
        STREAM_ROOM_MESSAGES | STREAM_NOTIFY_ROOM | STREAM_NOTIFY_USER | STREAM_NOTIFY_ALL
    )
}

fn stream_notify(collection: &str, event_name: String, args: Value) -> DdpMessage {
    DdpMessage::changed(collection, json!({ "eventName": event_name, "args": args }))
}

/// Render an event as a DDP `changed` message. Board-scoped notifications
/// have no DDP form.
pub(crate) fn encode_event(event: &Event) -> serde_json::Result<Option<String>> {
    let message = match event {
        Event::RoomMessage(message) => DdpMessage::changed(
            STREAM_ROOM_MESSAGES,
            json!({
                "_id": message.id,
                "rid": message.room_id,
                "msg": message.content,
                "ts": message.created_at,
                "u": {
                    "_id": message.user_id,
                    "username": message.username,
                    "name": message.username,
                },
            }),
        ),
        Event::RoomTyping(typing) => stream_notify(
            STREAM_NOTIFY_ROOM,
            format!("{}/typing", typing.room_id),
            json!([typing.username, typing.is_typing]),
        ),
        Event::StatusChanged(change) => stream_notify(
            STREAM_NOTIFY_ALL,
            STATUS_CHANGED_EVENT.to_owned(),
            json!([{
                "_id": change.user_id,
                "username": change.username,
                "status": change.status.public(),
            }]),
        ),
        Event::Typing(notice) => stream_notify(
            STREAM_NOTIFY_USER,
            format!("{}/typing", notice.recipient),
            json!([notice.from, notice.is_typing]),
        ),
        Event::Notify(notification) => {
            let (collection, event_name) = match &notification.target {
                ScopeTarget::Room(room) => {
                    (STREAM_NOTIFY_ROOM, format!("{room}/{}", notification.event_type))
                }
                ScopeTarget::User(user) => {
                    (STREAM_NOTIFY_USER, format!("{user}/{}", notification.event_type))
                }
                ScopeTarget::All => (STREAM_NOTIFY_ALL, notification.event_type.clone()),
                ScopeTarget::Board(_) => return Ok(None),
            };
            stream_notify(collection, event_name, json!([notification.data]))
        }
    };
    serde_json::to_string(&message).map(Some)
}

/// Lifecycle of a DDP session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DdpState {
    /// Transport open, not yet registered.
    Open,
    /// Registered; subscriptions and methods are accepted.
    Connected,
    /// Reader stopped.
    Closed,
}

/// Handler for DDP sessions.
pub struct DdpProtocol {
    session: Arc<Session>,
    services: HubServices,
    state: DdpState,
    /// Subscription id to the room it bound, if any.
    subscriptions: HashMap<String, Option<RoomId>>,
}

impl DdpProtocol {
    /// Create a handler bound to one session.
    pub fn new(session: Arc<Session>, services: HubServices) -> Self {
        Self {
            session,
            services,
            state: DdpState::Open,
            subscriptions: HashMap::new(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DdpState {
        self.state
    }

    fn send(&self, message: &DdpMessage) {
        match serde_json::to_string(message) {
            Ok(json) => {
                let _ = reply(&self.session, &self.services.registry, Frame::from(json));
            }
            Err(e) => warn!(conn_id = %self.session.id(), error = %e, "failed to serialize DDP reply"),
        }
    }

    /// Split a `sub`/`unsub` into (name, remaining params). The name comes
    /// from `name` or, failing that, from the first param.
    fn subscription_args(message: &DdpMessage) -> (Option<String>, Vec<Value>) {
        let mut params = message.params();
        if let Some(name) = &message.name {
            return (Some(name.clone()), params);
        }
        match params.first() {
            Some(Value::String(name)) => {
                let name = name.clone();
                let _ = params.remove(0);
                (Some(name), params)
            }
            _ => (None, params),
        }
    }

    fn handle_sub(&mut self, message: &DdpMessage) {
        let Some(id) = message.id.clone() else {
            warn!(conn_id = %self.session.id(), "sub without id");
            return;
        };
        let (name, args) = Self::subscription_args(message);
        let Some(name) = name else {
            self.send(&DdpMessage::nosub(
                Some(id),
                Some(DdpError::new(400, "bad-request").with_message("subscription name required")),
            ));
            return;
        };

        match name.as_str() {
            STREAM_ROOM_MESSAGES => {
                let room = args
                    .first()
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty());
                let Some(room) = room else {
                    self.send(&DdpMessage::nosub(
                        Some(id),
                        Some(DdpError::new(400, "bad-request").with_message("room id required")),
                    ));
                    return;
                };
                let room = RoomId::from(room);
                // Membership is visible to the router before `ready` is sent.
                let _ = self.session.join_room(room.clone());
                debug!(conn_id = %self.session.id(), room = %room, sub_id = %id, "subscribed to room");
                let _ = self.subscriptions.insert(id.clone(), Some(room));
                self.send(&DdpMessage::ready(id));
            }
            STREAM_NOTIFY_USER | STREAM_NOTIFY_ALL => {
                let _ = self.subscriptions.insert(id.clone(), None);
                self.send(&DdpMessage::ready(id));
            }
            other => {
                debug!(conn_id = %self.session.id(), name = other, "unknown subscription");
                self.send(&DdpMessage::nosub(
                    Some(id),
                    Some(
                        DdpError::new(404, "subscription-not-found")
                            .with_message(format!("Subscription '{other}' not found")),
                    ),
                ));
            }
        }
    }

    fn leave_if_unreferenced(&self, room: &RoomId) {
        let still_used = self
            .subscriptions
            .values()
            .any(|bound| bound.as_ref() == Some(room));
        if !still_used {
            let _ = self.session.leave_room(room);
        }
    }

    fn handle_unsub(&mut self, message: &DdpMessage) {
        let by_id = message
            .id
            .as_ref()
            .and_then(|id| self.subscriptions.remove(id));

        match by_id {
            Some(Some(room)) => self.leave_if_unreferenced(&room),
            Some(None) => {}
            None => {
                let named_room = message
                    .params()
                    .iter()
                    .filter_map(Value::as_str)
                    .find(|s| !s.is_empty() && !is_stream_name(s))
                    .map(RoomId::from);
                if let Some(room) = named_room {
                    self.subscriptions
                        .retain(|_, bound| bound.as_ref() != Some(&room));
                    let _ = self.session.leave_room(&room);
                } else {
                    self.subscriptions.clear();
                    let cleared = self.session.clear_rooms();
                    debug!(conn_id = %self.session.id(), cleared, "cleared all room subscriptions");
                }
            }
        }
        self.send(&DdpMessage::nosub(message.id.clone(), None));
    }

    async fn handle_method(&mut self, message: &DdpMessage) {
        let Some(id) = message.id.clone() else {
            warn!(conn_id = %self.session.id(), "method call without id");
            return;
        };
        let Some(method) = message.method.as_deref() else {
            self.send(&DdpMessage::result_error(
                id,
                DdpError::new(400, "bad-request").with_message("method name required"),
            ));
            return;
        };
        let params = message.params();
        let ctx = MethodContext {
            session: &self.session,
            services: &self.services,
        };
        let response = match self.services.methods.dispatch(method, &params, &ctx).await {
            Ok(result) => DdpMessage::result(id, result),
            Err(err) => DdpMessage::result_error(id, err.to_ddp_error()),
        };
        self.send(&response);
    }
}

#[async_trait]
impl ProtocolHandler for DdpProtocol {
    fn on_registered(&mut self) {
        self.state = DdpState::Connected;
    }

    async fn on_text(&mut self, text: &str) {
        let message: DdpMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(conn_id = %self.session.id(), error = %e, "discarding malformed DDP frame");
                return;
            }
        };

        match (self.state, message.msg.as_str()) {
            (DdpState::Closed, _) => {}
            (_, "connect") => {
                self.state = DdpState::Connected;
                self.send(&DdpMessage::connected(self.session.id().as_str()));
            }
            (_, "ping") => {
                self.on_pong();
                self.send(&DdpMessage::pong(message.id));
            }
            (_, "pong") => self.on_pong(),
            (DdpState::Open, kind) => {
                debug!(conn_id = %self.session.id(), kind, "message before connect");
                self.send(&DdpMessage::error("not connected"));
            }
            (DdpState::Connected, "sub") => self.handle_sub(&message),
            (DdpState::Connected, "unsub") => self.handle_unsub(&message),
            (DdpState::Connected, "method") => self.handle_method(&message).await,
            (DdpState::Connected, other) => {
                debug!(conn_id = %self.session.id(), kind = other, "ignoring unrecognized DDP message");
            }
        }
    }

    fn on_pong(&mut self) {
        self.session.mark_alive();
        self.services.presence.touch(self.session.user_id());
    }

    fn on_closed(&mut self) {
        self.state = DdpState::Closed;
        self.subscriptions.clear();
    }
}
