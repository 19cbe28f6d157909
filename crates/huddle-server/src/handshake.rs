//! Upgrade handshake: identity resolution and request rejection.
//!
//! Authentication happens upstream. By the time a request reaches the hub the
//! authentication layer has stamped the caller's user id (and optionally a
//! display name) into trusted headers. A request without a usable identity is
//! rejected with 401 before the WebSocket upgrade.

use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use huddle_core::UserId;
use huddle_hub::Identity;
use metrics::counter;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::metrics::WS_HANDSHAKE_REJECTIONS_TOTAL;

/// Why an upgrade request was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// No user id header.
    #[error("missing identity header {0}")]
    MissingIdentity(String),
    /// The user id header is not a positive integer.
    #[error("invalid user id {0:?}")]
    InvalidIdentity(String),
    /// The board path segment is not a numeric id.
    #[error("invalid board id {0:?}")]
    InvalidBoard(String),
}

impl HandshakeError {
    /// HTTP status returned for this rejection.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingIdentity(_) | Self::InvalidIdentity(_) => StatusCode::UNAUTHORIZED,
            Self::InvalidBoard(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Metric label for this rejection.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingIdentity(_) => "missing_identity",
            Self::InvalidIdentity(_) => "invalid_identity",
            Self::InvalidBoard(_) => "invalid_board",
        }
    }
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        counter!(WS_HANDSHAKE_REJECTIONS_TOTAL, "reason" => self.reason()).increment(1);
        debug!(reason = self.reason(), error = %self, "rejecting upgrade");
        let body = Json(json!({ "error": self.reason(), "message": self.to_string() }));
        (self.status_code(), body).into_response()
    }
}

/// Resolves the caller's identity from request headers.
pub trait IdentityResolver: Send + Sync {
    /// Identity of the caller, or the reason the request must be refused.
    fn resolve(&self, headers: &HeaderMap) -> Result<Identity, HandshakeError>;
}

/// Reads identity from headers set by a trusted authentication proxy.
#[derive(Clone, Debug)]
pub struct HeaderIdentity {
    user_id_header: String,
    username_header: String,
}

impl HeaderIdentity {
    /// Resolver reading the given header names.
    pub fn new(user_id_header: impl Into<String>, username_header: impl Into<String>) -> Self {
        Self {
            user_id_header: user_id_header.into(),
            username_header: username_header.into(),
        }
    }
}

impl Default for HeaderIdentity {
    fn default() -> Self {
        Self::new("x-user-id", "x-user-name")
    }
}

impl IdentityResolver for HeaderIdentity {
    fn resolve(&self, headers: &HeaderMap) -> Result<Identity, HandshakeError> {
        let raw = headers
            .get(self.user_id_header.as_str())
            .ok_or_else(|| HandshakeError::MissingIdentity(self.user_id_header.clone()))?;
        let raw = raw.to_str().map_err(|_| {
            HandshakeError::InvalidIdentity(String::from_utf8_lossy(raw.as_bytes()).into_owned())
        })?;
        let user_id: UserId = raw
            .parse()
            .map_err(|_| HandshakeError::InvalidIdentity(raw.to_owned()))?;
        if user_id.get() == 0 {
            return Err(HandshakeError::InvalidIdentity(raw.to_owned()));
        }

        let username = headers
            .get(self.username_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|name| !name.is_empty());

        Ok(match username {
            Some(name) => Identity::new(user_id).with_username(name),
            None => Identity::new(user_id),
        })
    }
}

/// Extractor yielding the caller's resolved identity.
pub struct Authenticated(pub Identity);

impl<S> FromRequestParts<S> for Authenticated
where
    Arc<dyn IdentityResolver>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = HandshakeError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let resolver = Arc::<dyn IdentityResolver>::from_ref(state);
        resolver.resolve(&parts.headers).map(Self)
    }
}
