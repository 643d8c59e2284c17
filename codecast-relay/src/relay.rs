//! Per-connection protocol state machine and fan-out rules.
//!
//! ```text
//!                connect                    join
//! Disconnected ──────────► Unjoined ─────────────────► Joined ◄──┐
//!      ▲                       │                         │  │     │ change / sync /
//!      │        disconnect     │                         │  └─────┘ join (re-join)
//!      └───────────────────────┴─────────────────────────┘
//!                                  disconnect (LEAVE)
//! ```
//!
//! [`Relay`] is transport-free: every input returns the list of
//! [`Delivery`]s it produced and the caller moves them onto the wire.
//! Inputs must be applied one at a time; see [`crate::service`] for the
//! task that serializes them.

use std::collections::HashMap;

use crate::protocol::{ClientEvent, ConnectionId, Participant, ServerEvent, SessionId};
use crate::registry::SessionRegistry;

/// Where a connection is in the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport is up, no JOIN yet
    Unjoined,
    /// Member of a session
    Joined { session_id: SessionId },
}

/// An event addressed to one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: ConnectionId,
    pub event: ServerEvent,
}

impl Delivery {
    pub fn new(to: ConnectionId, event: ServerEvent) -> Self {
        Self { to, event }
    }
}

/// Counters for monitoring relay health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub active_sessions: usize,
    pub joins: u64,
    pub changes_relayed: u64,
    pub syncs_relayed: u64,
    /// Events dropped as protocol violations
    pub violations: u64,
}

/// The relay core: registry plus connection states.
#[derive(Debug, Default)]
pub struct Relay {
    registry: SessionRegistry,
    connections: HashMap<ConnectionId, ConnectionState>,
    stats: RelayStats,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a new transport connection and return its id.
    pub fn connect(&mut self) -> ConnectionId {
        let id = ConnectionId::new();
        self.connections.insert(id, ConnectionState::Unjoined);
        self.stats.total_connections += 1;
        self.stats.active_connections += 1;
        log::debug!("Connection {id} accepted");
        id
    }

    /// Apply one inbound event from `from`.
    ///
    /// Events from unknown connections and events invalid in the sender's
    /// current state are dropped and counted as violations.
    pub fn dispatch(&mut self, from: ConnectionId, event: ClientEvent) -> Vec<Delivery> {
        let Some(state) = self.connections.get(&from).cloned() else {
            return self.violation(from, &event, "unknown connection");
        };

        match (state, event) {
            (state, ClientEvent::Join { session_id, display_name }) => {
                self.join(from, state, session_id, display_name)
            }
            (ConnectionState::Joined { session_id }, ClientEvent::Change { code }) => {
                self.change(from, &session_id, code)
            }
            (ConnectionState::Joined { session_id }, ClientEvent::Sync { code, target_connection_id }) => {
                self.sync(from, &session_id, code, target_connection_id)
            }
            (ConnectionState::Unjoined, event) => self.violation(from, &event, "not joined"),
        }
    }

    /// Tear down a connection, running LEAVE if it had joined.
    ///
    /// Unknown or already-disconnected ids are ignored.
    pub fn disconnect(&mut self, id: ConnectionId) -> Vec<Delivery> {
        let Some(state) = self.connections.remove(&id) else {
            return Vec::new();
        };
        self.stats.active_connections = self.stats.active_connections.saturating_sub(1);
        log::debug!("Connection {id} closed");

        match state {
            ConnectionState::Joined { .. } => self.leave(id),
            ConnectionState::Unjoined => Vec::new(),
        }
    }

    /// Protocol state of a live connection.
    pub fn state(&self, id: &ConnectionId) -> Option<&ConnectionState> {
        self.connections.get(id)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Current members of a session.
    pub fn members(&self, session_id: &SessionId) -> Vec<Participant> {
        self.registry.list_members(session_id).to_vec()
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            active_sessions: self.registry.session_count(),
            ..self.stats.clone()
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Protocol handlers
    // ───────────────────────────────────────────────────────────────

    fn join(
        &mut self,
        id: ConnectionId,
        state: ConnectionState,
        session_id: SessionId,
        display_name: String,
    ) -> Vec<Delivery> {
        let mut deliveries = Vec::new();

        // Display names are fixed for the life of the connection.
        let display_name = match &state {
            ConnectionState::Joined { session_id: current } if *current == session_id => self
                .registry
                .member(&id)
                .map(|p| p.display_name.clone())
                .unwrap_or(display_name),
            ConnectionState::Joined { .. } => {
                let name = self
                    .registry
                    .member(&id)
                    .map(|p| p.display_name.clone())
                    .unwrap_or(display_name);
                deliveries.extend(self.leave(id));
                name
            }
            ConnectionState::Unjoined => display_name,
        };

        self.registry
            .add_member(session_id.clone(), Participant::new(id, display_name.clone()));
        self.connections.insert(
            id,
            ConnectionState::Joined {
                session_id: session_id.clone(),
            },
        );
        self.stats.joins += 1;

        let members = self.members(&session_id);
        log::info!(
            "{display_name} ({id}) joined session {session_id} ({} members)",
            members.len()
        );

        let joined = ServerEvent::Joined {
            members: members.clone(),
            display_name,
            connection_id: id,
        };

        // Joiner first, then everyone already present.
        deliveries.push(Delivery::new(id, joined.clone()));
        deliveries.extend(
            members
                .iter()
                .filter(|p| p.connection_id != id)
                .map(|p| Delivery::new(p.connection_id, joined.clone())),
        );
        deliveries
    }

    fn change(&mut self, from: ConnectionId, session_id: &SessionId, code: String) -> Vec<Delivery> {
        self.stats.changes_relayed += 1;
        let event = ServerEvent::Change { code };
        self.registry
            .list_members(session_id)
            .iter()
            .filter(|p| p.connection_id != from)
            .map(|p| Delivery::new(p.connection_id, event.clone()))
            .collect()
    }

    fn sync(
        &mut self,
        from: ConnectionId,
        session_id: &SessionId,
        code: String,
        target: ConnectionId,
    ) -> Vec<Delivery> {
        // Snapshots never cross session boundaries.
        if self.registry.find_session(&target) != Some(session_id) {
            self.stats.violations += 1;
            log::debug!("Dropping sync from {from}: target {target} is not in session {session_id}");
            return Vec::new();
        }
        self.stats.syncs_relayed += 1;
        vec![Delivery::new(
            target,
            ServerEvent::Sync {
                code,
                target_connection_id: target,
            },
        )]
    }

    fn leave(&mut self, id: ConnectionId) -> Vec<Delivery> {
        let Some(removal) = self.registry.remove_member(&id) else {
            return Vec::new();
        };

        log::info!(
            "{} ({id}) left session {}",
            removal.participant.display_name,
            removal.session_id
        );
        if removal.session_closed() {
            log::info!("Session {} closed (empty)", removal.session_id);
            return Vec::new();
        }

        let left = ServerEvent::Left {
            connection_id: id,
            display_name: removal.participant.display_name,
        };
        removal
            .remaining
            .iter()
            .map(|p| Delivery::new(p.connection_id, left.clone()))
            .collect()
    }

    fn violation(&mut self, from: ConnectionId, event: &ClientEvent, reason: &str) -> Vec<Delivery> {
        self.stats.violations += 1;
        log::debug!("Dropping {} from {from}: {reason}", event.name());
        Vec::new()
    }
}
