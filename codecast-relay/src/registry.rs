//! Session registry: which connection belongs to which session.
//!
//! Pure bookkeeping with no I/O and no locking. The registry is owned by a
//! single [`Relay`](crate::relay::Relay) and mutated only from its event loop.
//!
//! ```text
//! sessions: SessionId ──► [Participant, Participant, …]   (join order)
//! index:    ConnectionId ──► SessionId
//! ```
//!
//! A session exists exactly while it has at least one member.

use std::collections::HashMap;

use crate::protocol::{ConnectionId, Participant, SessionId};

/// Result of removing a connection from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    /// Session the connection was a member of
    pub session_id: SessionId,
    /// The record that was removed
    pub participant: Participant,
    /// Members still in the session (empty when the session was dropped)
    pub remaining: Vec<Participant>,
}

impl Removal {
    /// Whether the removal emptied (and therefore deleted) the session.
    pub fn session_closed(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// In-memory map of sessions to their members.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Vec<Participant>>,
    index: HashMap<ConnectionId, SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `participant` into `session_id`, creating the session if absent.
    ///
    /// Re-adding a connection already in the same session replaces its record
    /// in place. A connection found in a different session is moved, so it is
    /// never a member of two sessions at once.
    pub fn add_member(&mut self, session_id: SessionId, participant: Participant) {
        let id = participant.connection_id;

        if let Some(current) = self.index.get(&id) {
            if *current == session_id {
                if let Some(slot) = self
                    .sessions
                    .get_mut(&session_id)
                    .and_then(|members| members.iter_mut().find(|p| p.connection_id == id))
                {
                    *slot = participant;
                    return;
                }
            } else {
                self.remove_member(&id);
            }
        }

        self.sessions
            .entry(session_id.clone())
            .or_default()
            .push(participant);
        self.index.insert(id, session_id);
    }

    /// Remove a connection from whichever session holds it.
    ///
    /// Deletes the session when it becomes empty. Returns `None` if the
    /// connection was not a member of any session.
    pub fn remove_member(&mut self, connection_id: &ConnectionId) -> Option<Removal> {
        let session_id = self.index.remove(connection_id)?;
        let members = self.sessions.get_mut(&session_id)?;
        let position = members
            .iter()
            .position(|p| p.connection_id == *connection_id)?;
        let participant = members.remove(position);
        let remaining = members.clone();

        if remaining.is_empty() {
            self.sessions.remove(&session_id);
        }

        Some(Removal {
            session_id,
            participant,
            remaining,
        })
    }

    /// Current members of a session in join order; empty if unknown.
    pub fn list_members(&self, session_id: &SessionId) -> &[Participant] {
        self.sessions
            .get(session_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Session a connection currently belongs to.
    pub fn find_session(&self, connection_id: &ConnectionId) -> Option<&SessionId> {
        self.index.get(connection_id)
    }

    /// Roster record of a joined connection.
    pub fn member(&self, connection_id: &ConnectionId) -> Option<&Participant> {
        let session_id = self.index.get(connection_id)?;
        self.list_members(session_id)
            .iter()
            .find(|p| p.connection_id == *connection_id)
    }

    pub fn contains_session(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of joined connections across all sessions.
    pub fn member_count(&self) -> usize {
        self.index.len()
    }

    /// All live session ids.
    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }
}
