//! Named events exchanged between participants and the relay.
//!
//! Event taxonomy:
//! ```text
//! ┌─────────┬──────────────────────┬────────────────────────────────────────────┐
//! │ event   │ direction            │ payload                                    │
//! ├─────────┼──────────────────────┼────────────────────────────────────────────┤
//! │ join    │ client → relay       │ sessionId, displayName                     │
//! │ joined  │ relay  → client(s)   │ members[], displayName, connectionId       │
//! │ left    │ relay  → clients     │ connectionId, displayName                  │
//! │ change  │ both                 │ code                                       │
//! │ sync    │ client → relay → one │ code, targetConnectionId                   │
//! └─────────┴──────────────────────┴────────────────────────────────────────────┘
//! ```
//!
//! On the JSON codec an event is an object keyed by its snake_case name,
//! e.g. `{"change":{"code":"x=1"}}`; payload fields are camelCase.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of one transport connection.
///
/// Assigned by the relay at connect time. Random v4 UUIDs, so an id is never
/// handed out twice for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a fresh connection id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (for testing).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque session name, chosen by whoever creates or shares the session.
///
/// The relay never inspects or validates the contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random session id, for shells offering a "new session" action.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One roster entry: a joined connection and its display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub display_name: String,
}

impl Participant {
    pub fn new(connection_id: ConnectionId, display_name: impl Into<String>) -> Self {
        Self {
            connection_id,
            display_name: display_name.into(),
        }
    }
}

/// Events a participant sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Join (and implicitly create) a session.
    Join {
        session_id: SessionId,
        display_name: String,
    },
    /// Full buffer content after a local edit.
    Change { code: String },
    /// Buffer snapshot addressed to a single peer.
    Sync {
        code: String,
        target_connection_id: ConnectionId,
    },
}

impl ClientEvent {
    pub fn join(session_id: impl Into<SessionId>, display_name: impl Into<String>) -> Self {
        Self::Join {
            session_id: session_id.into(),
            display_name: display_name.into(),
        }
    }

    pub fn change(code: impl Into<String>) -> Self {
        Self::Change { code: code.into() }
    }

    pub fn sync(code: impl Into<String>, target_connection_id: ConnectionId) -> Self {
        Self::Sync {
            code: code.into(),
            target_connection_id,
        }
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Change { .. } => "change",
            Self::Sync { .. } => "sync",
        }
    }
}

/// Events the relay sends to participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Roster after a join. Sent to the joiner and every existing member;
    /// `display_name`/`connection_id` name the participant who joined.
    Joined {
        members: Vec<Participant>,
        display_name: String,
        connection_id: ConnectionId,
    },
    /// A member's connection went away.
    Left {
        connection_id: ConnectionId,
        display_name: String,
    },
    /// Another member's buffer content.
    Change { code: String },
    /// Point-to-point snapshot, forwarded as received.
    Sync {
        code: String,
        target_connection_id: ConnectionId,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Joined { .. } => "joined",
            Self::Left { .. } => "left",
            Self::Change { .. } => "change",
            Self::Sync { .. } => "sync",
        }
    }
}
