//! # huddle-core
//!
//! Foundation types shared by every huddle crate:
//!
//! - Branded string ids ([`ConnectionId`], [`RoomId`], [`MessageId`]) and
//!   numeric ids ([`UserId`], [`BoardId`])
//! - Presence and chat payload types exchanged with external collaborators
//! - Collaborator traits ([`PresenceStore`], [`MessageStore`]) with in-memory
//!   implementations
//! - `tracing` subscriber bootstrap

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod presence;
pub mod store;

pub use errors::StoreError;
pub use ids::{BoardId, ConnectionId, MessageId, RoomId, UserId};
pub use presence::{PresenceRecord, PresenceStatus};
pub use store::{
    MemoryMessageStore, MemoryPresenceStore, MessageStore, NewRoomMessage, PresenceStore,
    RoomMessage,
};
