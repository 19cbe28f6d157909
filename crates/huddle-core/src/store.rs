//! Storage collaborator seams.
//!
//! The hub never owns durable state. Presence records and chat messages are
//! written through these traits; production deployments plug in their
//! database-backed implementations, the binary and tests use the in-memory
//! ones below.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::ids::{MessageId, RoomId, UserId};
use crate::presence::{PresenceRecord, PresenceStatus};

/// Writer for the external presence table.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Persist a status transition for a user.
    async fn set_status(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Refresh the last-seen timestamp without changing the status.
    async fn touch(&self, user_id: UserId, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// A chat message about to be persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewRoomMessage {
    /// Target room.
    pub room_id: RoomId,
    /// Author.
    pub user_id: UserId,
    /// Author display name, when known.
    pub username: Option<String>,
    /// Message body.
    pub content: String,
}

/// A persisted chat message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMessage {
    /// Assigned message id.
    pub id: MessageId,
    /// Room the message belongs to.
    pub room_id: RoomId,
    /// Author.
    pub user_id: UserId,
    /// Author display name, when known.
    pub username: Option<String>,
    /// Message body.
    pub content: String,
    /// Creation time assigned by the store.
    pub created_at: DateTime<Utc>,
}

/// Persistence for chat-room messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message and return the stored form.
    async fn save_room_message(&self, message: NewRoomMessage) -> Result<RoomMessage, StoreError>;
}

/// In-memory presence table.
#[derive(Default)]
pub struct MemoryPresenceStore {
    records: RwLock<HashMap<UserId, PresenceRecord>>,
}

impl MemoryPresenceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record for a user.
    pub fn get(&self, user_id: UserId) -> Option<PresenceRecord> {
        self.records.read().get(&user_id).cloned()
    }

    /// Number of users with a record.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no user has a record yet.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_status(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let _ = self.records.write().insert(
            user_id,
            PresenceRecord {
                user_id,
                status,
                last_seen: at,
            },
        );
        Ok(())
    }

    async fn touch(&self, user_id: UserId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut records = self.records.write();
        let record = records.entry(user_id).or_insert(PresenceRecord {
            user_id,
            status: PresenceStatus::Online,
            last_seen: at,
        });
        record.last_seen = at;
        Ok(())
    }
}

/// In-memory chat message log.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<Vec<RoomMessage>>,
}

impl MemoryMessageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages stored for a room, oldest first.
    pub fn room_messages(&self, room_id: &RoomId) -> Vec<RoomMessage> {
        self.messages
            .read()
            .iter()
            .filter(|m| &m.room_id == room_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn save_room_message(&self, message: NewRoomMessage) -> Result<RoomMessage, StoreError> {
        let stored = RoomMessage {
            id: MessageId::generate(),
            room_id: message.room_id,
            user_id: message.user_id,
            username: message.username,
            content: message.content,
            created_at: Utc::now(),
        };
        self.messages.write().push(stored.clone());
        Ok(stored)
    }
}
