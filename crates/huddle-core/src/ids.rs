//! Branded ID newtypes for type safety.
//!
//! Connection, room and message ids are opaque strings; user and board ids are
//! the numeric keys handed over by the authentication layer and the board
//! store. Wrapping them keeps a board id from being passed where a user id is
//! expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw numeric id.
            #[must_use]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// The raw numeric value.
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse().map(Self)
            }
        }
    };
}

branded_id! {
    /// Unique identifier for one physical connection (UUID v7, time-ordered).
    ConnectionId
}

branded_id! {
    /// Chat room identifier (the `rid` of the subscription protocol).
    RoomId
}

branded_id! {
    /// Identifier of a persisted chat message.
    MessageId
}

numeric_id! {
    /// Authenticated user identifier.
    UserId
}

numeric_id! {
    /// Board identifier.
    BoardId
}

impl ConnectionId {
    /// Create a new random connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Length of generated message ids, matching chat-client expectations.
const MESSAGE_ID_LEN: usize = 17;

impl MessageId {
    /// Generate a random 17-character alphanumeric id.
    #[must_use]
    pub fn generate() -> Self {
        let mut raw = Uuid::new_v4().simple().to_string();
        raw.truncate(MESSAGE_ID_LEN);
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn connection_ids_are_time_ordered() {
        let a = ConnectionId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = ConnectionId::new();
        assert!(a < b);
    }

    #[test]
    fn branded_id_serializes_transparently() {
        let room = RoomId::from("general");
        let json = serde_json::to_string(&room).unwrap();
        assert_eq!(json, "\"general\"");
        let back: RoomId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, room);
    }

    #[test]
    fn numeric_id_serializes_as_number() {
        let user = UserId::new(42);
        assert_eq!(serde_json::to_string(&user).unwrap(), "42");
        let board: BoardId = serde_json::from_str("7").unwrap();
        assert_eq!(board.get(), 7);
    }

    #[test]
    fn numeric_id_parses_from_str() {
        let board: BoardId = " 12 ".parse().unwrap();
        assert_eq!(board, BoardId::new(12));
        assert!("abc".parse::<UserId>().is_err());
        assert!("-1".parse::<UserId>().is_err());
    }

    #[test]
    fn message_id_has_fixed_length() {
        let id = MessageId::generate();
        assert_eq!(id.len(), MESSAGE_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn display_and_deref() {
        let conn = ConnectionId::from("conn_1");
        assert_eq!(conn.to_string(), "conn_1");
        assert_eq!(&*conn, "conn_1");
        assert_eq!(UserId::new(3).to_string(), "3");
    }
}
