//! Hub events and their delivery targets.
//!
//! Every broadcast is one [`Event`]. The event decides its own
//! [`ScopeTarget`]; each wire protocol decides how (and whether) to render it.

use huddle_core::{BoardId, PresenceStatus, RoomId, RoomMessage, UserId};
use serde_json::Value;

use crate::session::{Session, SessionScope};

/// Which sessions a broadcast is addressed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScopeTarget {
    /// Every session attached to the board.
    Board(BoardId),
    /// Every session of the user, regardless of scope.
    User(UserId),
    /// Every session subscribed to the chat room.
    Room(RoomId),
    /// Every live session.
    All,
}

impl ScopeTarget {
    /// Whether `session` belongs to this target.
    pub fn matches(&self, session: &Session) -> bool {
        match self {
            Self::Board(board_id) => session.scope() == SessionScope::Board(*board_id),
            Self::User(user_id) => session.user_id() == *user_id,
            Self::Room(room) => session.in_room(room),
            Self::All => true,
        }
    }
}

/// Scope of an online-presence query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceScope {
    /// Sessions attached to the board.
    Board(BoardId),
    /// Sessions not attached to any board.
    Global,
    /// Any session.
    Anywhere,
}

impl PresenceScope {
    /// Whether `session` counts toward this scope.
    pub fn includes(self, session: &Session) -> bool {
        match self {
            Self::Board(board_id) => session.scope() == SessionScope::Board(board_id),
            Self::Global => session.scope() == SessionScope::Global,
            Self::Anywhere => true,
        }
    }
}

/// An application notification addressed to a scope.
///
/// Board broadcasts, private messages and custom room or global
/// notifications all take this shape.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    /// Delivery target.
    pub target: ScopeTarget,
    /// Application event name (`type` on the board wire).
    pub event_type: String,
    /// Originating user, when the event came from a client.
    pub user_id: Option<UserId>,
    /// Event payload.
    pub data: Value,
}

/// A private typing indicator between two users.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypingNotice {
    /// The user who is typing.
    pub from: UserId,
    /// The user being notified.
    pub recipient: UserId,
    /// Started (`true`) or stopped (`false`) typing.
    pub is_typing: bool,
}

/// A typing indicator inside a chat room.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomTyping {
    /// Room the user is typing in.
    pub room_id: RoomId,
    /// Display name of the typing user.
    pub username: String,
    /// Started (`true`) or stopped (`false`) typing.
    pub is_typing: bool,
}

/// A user's published presence changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusChange {
    /// The user whose status changed.
    pub user_id: UserId,
    /// Display name, when known.
    pub username: Option<String>,
    /// Published status. Never [`PresenceStatus::Invisible`].
    pub status: PresenceStatus,
}

/// Something to deliver to a set of sessions.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Scoped application notification.
    Notify(Notification),
    /// Private typing indicator.
    Typing(TypingNotice),
    /// A chat message was persisted.
    RoomMessage(RoomMessage),
    /// Room typing indicator.
    RoomTyping(RoomTyping),
    /// Presence change, delivered to everyone.
    StatusChanged(StatusChange),
}

impl Event {
    /// Board broadcast originated by the server.
    pub fn board(board_id: BoardId, event_type: impl Into<String>, data: Value) -> Self {
        Self::Notify(Notification {
            target: ScopeTarget::Board(board_id),
            event_type: event_type.into(),
            user_id: None,
            data,
        })
    }

    /// Private message to every session of `recipient`.
    pub fn private(recipient: UserId, event_type: impl Into<String>, data: Value) -> Self {
        Self::Notify(Notification {
            target: ScopeTarget::User(recipient),
            event_type: event_type.into(),
            user_id: None,
            data,
        })
    }

    /// Which sessions receive this event.
    pub fn target(&self) -> ScopeTarget {
        match self {
            Self::Notify(notification) => notification.target.clone(),
            Self::Typing(notice) => ScopeTarget::User(notice.recipient),
            Self::RoomMessage(message) => ScopeTarget::Room(message.room_id.clone()),
            Self::RoomTyping(typing) => ScopeTarget::Room(typing.room_id.clone()),
            Self::StatusChanged(_) => ScopeTarget::All,
        }
    }

    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Notify(_) => "notify",
            Self::Typing(_) => "typing",
            Self::RoomMessage(_) => "room_message",
            Self::RoomTyping(_) => "room_typing",
            Self::StatusChanged(_) => "status_changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use huddle_core::MessageId;
    use serde_json::json;

    use super::*;
    use crate::protocol::WireProtocol;
    use crate::session::Identity;

    fn session(user: u64, scope: SessionScope) -> std::sync::Arc<Session> {
        Session::new(
            Identity::new(UserId::new(user)),
            scope,
            WireProtocol::Board,
            4,
        )
        .0
    }

    #[test]
    fn board_target_matches_only_that_board() {
        let on_seven = session(1, SessionScope::Board(BoardId::new(7)));
        let on_eight = session(1, SessionScope::Board(BoardId::new(8)));
        let global = session(1, SessionScope::Global);
        let target = ScopeTarget::Board(BoardId::new(7));
        assert!(target.matches(&on_seven));
        assert!(!target.matches(&on_eight));
        assert!(!target.matches(&global));
    }

    #[test]
    fn user_target_ignores_scope() {
        let board = session(5, SessionScope::Board(BoardId::new(7)));
        let global = session(5, SessionScope::Global);
        let other = session(6, SessionScope::Global);
        let target = ScopeTarget::User(UserId::new(5));
        assert!(target.matches(&board));
        assert!(target.matches(&global));
        assert!(!target.matches(&other));
    }

    #[test]
    fn room_target_follows_membership() {
        let s = session(1, SessionScope::Global);
        let target = ScopeTarget::Room(RoomId::from("general"));
        assert!(!target.matches(&s));
        let _ = s.join_room(RoomId::from("general"));
        assert!(target.matches(&s));
    }

    #[test]
    fn presence_scopes() {
        let board = session(1, SessionScope::Board(BoardId::new(3)));
        let global = session(1, SessionScope::Global);
        assert!(PresenceScope::Board(BoardId::new(3)).includes(&board));
        assert!(!PresenceScope::Board(BoardId::new(4)).includes(&board));
        assert!(!PresenceScope::Global.includes(&board));
        assert!(PresenceScope::Global.includes(&global));
        assert!(PresenceScope::Anywhere.includes(&board));
    }

    #[test]
    fn events_derive_their_target() {
        assert_eq!(
            Event::board(BoardId::new(7), "card_moved", json!({})).target(),
            ScopeTarget::Board(BoardId::new(7))
        );
        assert_eq!(
            Event::private(UserId::new(2), "dm", json!({})).target(),
            ScopeTarget::User(UserId::new(2))
        );
        let typing = Event::Typing(TypingNotice {
            from: UserId::new(1),
            recipient: UserId::new(2),
            is_typing: true,
        });
        assert_eq!(typing.target(), ScopeTarget::User(UserId::new(2)));

        let message = Event::RoomMessage(RoomMessage {
            id: MessageId::generate(),
            room_id: RoomId::from("general"),
            user_id: UserId::new(1),
            username: None,
            content: "hi".into(),
            created_at: Utc::now(),
        });
        assert_eq!(message.target(), ScopeTarget::Room(RoomId::from("general")));

        let status = Event::StatusChanged(StatusChange {
            user_id: UserId::new(1),
            username: None,
            status: PresenceStatus::Online,
        });
        assert_eq!(status.target(), ScopeTarget::All);
        assert_eq!(status.kind(), "status_changed");
    }
}
