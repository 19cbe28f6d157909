//! # huddle-hub
//!
//! Real-time connection hub.
//!
//! - [`registry`]: single control loop owning live sessions and presence counts
//! - [`router`]: scope-filtered, non-blocking fan-out with slow-consumer eviction
//! - [`pump`]: per-session reader and writer tasks
//! - [`heartbeat`]: eviction of sessions that stopped answering keepalives
//! - [`presence`]: online/offline transitions and the ordered presence writer
//! - [`protocol`]: board envelope and DDP chat protocols
//! - [`hub`]: the facade used by the HTTP layer and upstream services

#![deny(unsafe_code)]

pub mod event;
pub mod heartbeat;
pub mod hub;
pub mod metrics;
pub mod presence;
pub mod protocol;
pub mod pump;
pub mod registry;
pub mod router;
pub mod session;

#[cfg(test)]
mod test_support;

pub use event::{Event, Notification, PresenceScope, ScopeTarget};
pub use hub::{Hub, HubBuilder, HubConfig, HubError, Registered};
pub use protocol::WireProtocol;
pub use protocol::board::{AllowAll, BoardFrame, InboundPolicy};
pub use protocol::methods::{MethodContext, MethodError, MethodHandler, MethodRegistry};
pub use registry::{DisconnectReason, RegistryHandle};
pub use router::DeliveryReport;
pub use session::{Identity, Session, SessionScope};
