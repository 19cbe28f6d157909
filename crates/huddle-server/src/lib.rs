//! # huddle-server
//!
//! Axum HTTP + WebSocket server in front of the huddle hub.
//!
//! - `/ws/boards/{board_id}`, `/ws/private`, `/ws/chat` upgrade endpoints
//! - Trusted-header identity resolution at the handshake
//! - `/health` and Prometheus `/metrics`
//! - Graceful shutdown

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod handshake;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;

pub use config::{ServerConfig, hub_config};
pub use errors::ServerError;
pub use handshake::{HandshakeError, HeaderIdentity, IdentityResolver};
pub use server::HuddleServer;
