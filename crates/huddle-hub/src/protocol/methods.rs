//! DDP method table and the built-in chat methods.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use huddle_core::{NewRoomMessage, PresenceStatus, RoomId, StoreError};
use metrics::{counter, histogram};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::warn;

use super::HubServices;
use super::ddp::DdpError;
use crate::event::{Event, RoomTyping};
use crate::metrics::{DDP_METHOD_CALLS_TOTAL, DDP_METHOD_DURATION_SECONDS, DDP_METHOD_ERRORS_TOTAL};
use crate::session::Session;

/// Errors returned by method handlers.
#[derive(Debug, Error)]
pub enum MethodError {
    /// The call's parameters are missing or malformed.
    #[error("{message}")]
    InvalidParams {
        /// Human-readable description.
        message: String,
    },
    /// No handler is registered under the method name.
    #[error("Method '{method}' not found")]
    NotFound {
        /// The requested method.
        method: String,
    },
    /// A storage collaborator failed.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl MethodError {
    /// Shorthand for [`MethodError::InvalidParams`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Numeric error code carried in the DDP `error` field.
    pub fn code(&self) -> u16 {
        match self {
            Self::InvalidParams { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::Storage(_) => 500,
        }
    }

    /// Machine-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidParams { .. } => "invalid-params",
            Self::NotFound { .. } => "method-not-found",
            Self::Storage(_) => "storage-error",
        }
    }

    /// Render as the `error` object of a DDP `result`.
    pub fn to_ddp_error(&self) -> DdpError {
        DdpError::new(self.code(), self.reason()).with_message(self.to_string())
    }
}

/// Context passed to every method call.
pub struct MethodContext<'a> {
    /// The calling session.
    pub session: &'a Arc<Session>,
    /// Shared hub collaborators.
    pub services: &'a HubServices,
}

/// Trait implemented by every DDP method handler.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Execute the method with its positional params.
    async fn call(&self, params: &[Value], ctx: &MethodContext<'_>) -> Result<Value, MethodError>;
}

/// Registry mapping method names to handlers.
pub struct MethodRegistry {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl MethodRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with `sendMessage`, `typing` and `setUserStatus`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("sendMessage", SendMessage);
        registry.register("typing", Typing);
        registry.register("setUserStatus", SetUserStatus);
        registry
    }

    /// Register a handler for a method name, replacing any previous one.
    pub fn register(&mut self, method: &str, handler: impl MethodHandler + 'static) {
        let _ = self.handlers.insert(method.to_owned(), Arc::new(handler));
    }

    /// Run a method to completion.
    pub async fn dispatch(
        &self,
        method: &str,
        params: &[Value],
        ctx: &MethodContext<'_>,
    ) -> Result<Value, MethodError> {
        counter!(DDP_METHOD_CALLS_TOTAL, "method" => method.to_owned()).increment(1);

        let Some(handler) = self.handlers.get(method) else {
            counter!(DDP_METHOD_ERRORS_TOTAL, "method" => method.to_owned(), "reason" => "method-not-found")
                .increment(1);
            return Err(MethodError::NotFound {
                method: method.to_owned(),
            });
        };

        let start = Instant::now();
        let result = handler.call(params, ctx).await;
        let duration = start.elapsed();
        histogram!(DDP_METHOD_DURATION_SECONDS, "method" => method.to_owned())
            .record(duration.as_secs_f64());

        if let Err(err) = &result {
            counter!(DDP_METHOD_ERRORS_TOTAL, "method" => method.to_owned(), "reason" => err.reason())
                .increment(1);
            warn!(method, conn_id = %ctx.session.id(), error = %err, "method call failed");
        }
        result
    }

    /// List all registered method names (sorted).
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check whether a method is registered.
    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty_str<'a>(value: Option<&'a Value>, what: &str) -> Result<&'a str, MethodError> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| MethodError::invalid(format!("{what} is required")))
}

/// `sendMessage([{rid, msg}])`: persist, then broadcast to the room.
///
/// Nothing is broadcast when persistence fails.
pub struct SendMessage;

#[async_trait]
impl MethodHandler for SendMessage {
    async fn call(&self, params: &[Value], ctx: &MethodContext<'_>) -> Result<Value, MethodError> {
        let arg = params
            .first()
            .filter(|v| v.is_object())
            .ok_or_else(|| MethodError::invalid("expected a message object with rid and msg"))?;
        let room_id = non_empty_str(arg.get("rid"), "rid")?;
        let content = arg
            .get("msg")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| MethodError::invalid("msg is required"))?;

        let stored = ctx
            .services
            .messages
            .save_room_message(NewRoomMessage {
                room_id: RoomId::from(room_id),
                user_id: ctx.session.user_id(),
                username: ctx.session.username().map(str::to_owned),
                content: content.to_owned(),
            })
            .await?;

        let id = stored.id.clone();
        ctx.services.registry.broadcast(Event::RoomMessage(stored));
        Ok(json!({ "_id": id }))
    }
}

/// `typing([rid, isTyping])`: room typing indicator.
pub struct Typing;

#[async_trait]
impl MethodHandler for Typing {
    async fn call(&self, params: &[Value], ctx: &MethodContext<'_>) -> Result<Value, MethodError> {
        let room_id = non_empty_str(params.first(), "room id")?;
        let is_typing = params.get(1).and_then(Value::as_bool).unwrap_or(false);
        ctx.services.registry.broadcast(Event::RoomTyping(RoomTyping {
            room_id: RoomId::from(room_id),
            username: ctx.session.identity().display_name(),
            is_typing,
        }));
        Ok(Value::Null)
    }
}

/// `setUserStatus([status])`: explicit presence status.
pub struct SetUserStatus;

#[async_trait]
impl MethodHandler for SetUserStatus {
    async fn call(&self, params: &[Value], ctx: &MethodContext<'_>) -> Result<Value, MethodError> {
        let raw = non_empty_str(params.first(), "status")?;
        let status = PresenceStatus::parse(raw)
            .ok_or_else(|| MethodError::invalid(format!("unknown status '{raw}'")))?;
        ctx.services
            .registry
            .set_status(ctx.session.user_id(), status);
        Ok(Value::Null)
    }
}
