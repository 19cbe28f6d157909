//! `HuddleServer`: Axum HTTP + WebSocket front end for the hub.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRef, Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use huddle_core::BoardId;
use huddle_hub::{Hub, Identity, PresenceScope, SessionScope, WireProtocol};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::handshake::{Authenticated, HandshakeError, HeaderIdentity, IdentityResolver};
use crate::health::{self, HealthResponse};
use crate::metrics::{self as server_metrics, WS_UPGRADES_REFUSED_TOTAL};
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The connection hub.
    pub hub: Arc<Hub>,
    /// Resolves the caller's identity during the handshake.
    pub identity: Arc<dyn IdentityResolver>,
    /// Prometheus handle for `/metrics`.
    pub metrics: PrometheusHandle,
    /// Cancelled once shutdown begins.
    pub shutdown: CancellationToken,
    /// When the server started.
    pub start_time: Instant,
    /// Largest accepted inbound message.
    pub max_message_size: usize,
}

impl FromRef<AppState> for Arc<dyn IdentityResolver> {
    fn from_ref(state: &AppState) -> Self {
        state.identity.clone()
    }
}

/// The huddle HTTP server.
pub struct HuddleServer {
    config: ServerConfig,
    hub: Arc<Hub>,
    identity: Arc<dyn IdentityResolver>,
    metrics: PrometheusHandle,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl HuddleServer {
    /// Create a server in front of `hub`.
    pub fn new(config: ServerConfig, hub: Arc<Hub>, metrics: PrometheusHandle) -> Self {
        let identity = Arc::new(HeaderIdentity::new(
            config.user_id_header.clone(),
            config.username_header.clone(),
        ));
        Self {
            config,
            hub,
            identity,
            metrics,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    /// Replace the handshake identity resolver.
    #[must_use]
    pub fn with_identity_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.identity = resolver;
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
            identity: self.identity.clone(),
            metrics: self.metrics.clone(),
            shutdown: self.shutdown.token(),
            start_time: self.start_time,
            max_message_size: self.config.max_message_size,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws/boards/{board_id}", get(board_ws_handler))
            .route("/ws/private", get(private_ws_handler))
            .route("/ws/chat", get(chat_ws_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address and the serving task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            if let Err(e) = served {
                error!(error = %e, "server stopped with error");
            }
        });

        info!(%local_addr, "huddle server listening");
        Ok((local_addr, handle))
    }

    /// The connection hub.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.hub.connection_count().await;
    let online = state.hub.online_users(PresenceScope::Anywhere).await.len();
    Json(health::health_check(state.start_time, connections, online))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        server_metrics::render(&state.metrics),
    )
        .into_response()
}

/// GET /ws/boards/{board_id}
async fn board_ws_handler(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(board_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Ok(board_id) = board_id.parse::<BoardId>() else {
        return HandshakeError::InvalidBoard(board_id).into_response();
    };
    upgrade(
        state,
        ws,
        identity,
        SessionScope::Board(board_id),
        WireProtocol::Board,
    )
}

/// GET /ws/private
async fn private_ws_handler(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, ws, identity, SessionScope::Global, WireProtocol::Board)
}

/// GET /ws/chat
async fn chat_ws_handler(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, ws, identity, SessionScope::Global, WireProtocol::Ddp)
}

fn upgrade(
    state: AppState,
    ws: WebSocketUpgrade,
    identity: Identity,
    scope: SessionScope,
    protocol: WireProtocol,
) -> Response {
    if state.shutdown.is_cancelled() {
        counter!(WS_UPGRADES_REFUSED_TOTAL).increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    let hub = state.hub;
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| async move {
            match hub.connect(socket, identity, scope, protocol).await {
                Ok(reason) => debug!(reason = reason.as_str(), "websocket session ended"),
                Err(e) => {
                    counter!(WS_UPGRADES_REFUSED_TOTAL).increment(1);
                    warn!(error = %e, "hub refused websocket session");
                }
            }
        })
}
