//! Presence status and the persisted presence record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// User presence status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// At least one live connection.
    Online,
    /// Connected but marked away by the user.
    Away,
    /// Connected but marked busy by the user.
    Busy,
    /// Connected but hidden from other users.
    Invisible,
    /// No live connection.
    #[default]
    Offline,
}

impl PresenceStatus {
    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Away => "away",
            Self::Busy => "busy",
            Self::Invisible => "invisible",
            Self::Offline => "offline",
        }
    }

    /// Parse a wire name; unknown names yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "online" => Some(Self::Online),
            "away" => Some(Self::Away),
            "busy" => Some(Self::Busy),
            "invisible" => Some(Self::Invisible),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }

    /// The status other users are allowed to see.
    ///
    /// Invisible users are published as offline.
    #[must_use]
    pub fn public(self) -> Self {
        match self {
            Self::Invisible => Self::Offline,
            other => other,
        }
    }
}

/// Externally persisted presence of one user. Last write wins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    /// The user.
    pub user_id: UserId,
    /// Current status.
    pub status: PresenceStatus,
    /// Last time the user proved liveness or changed status.
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip_names() {
        for status in [
            PresenceStatus::Online,
            PresenceStatus::Away,
            PresenceStatus::Busy,
            PresenceStatus::Invisible,
            PresenceStatus::Offline,
        ] {
            assert_eq!(PresenceStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PresenceStatus::parse("sleeping"), None);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&PresenceStatus::Busy).unwrap();
        assert_eq!(json, "\"busy\"");
    }

    #[test]
    fn invisible_is_published_offline() {
        assert_eq!(PresenceStatus::Invisible.public(), PresenceStatus::Offline);
        assert_eq!(PresenceStatus::Away.public(), PresenceStatus::Away);
    }

    #[test]
    fn default_is_offline() {
        assert_eq!(PresenceStatus::default(), PresenceStatus::Offline);
    }
}
