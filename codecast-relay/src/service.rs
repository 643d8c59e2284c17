//! Relay service: a single task that owns the [`Relay`] and serializes input.
//!
//! ```text
//! connection task ──┐                         ┌──► outbox (conn A) ──► socket A
//! connection task ──┼── Command (mpsc) ──► RelayService ──► outbox (conn B) ──► socket B
//! connection task ──┘     one at a time       └──► outbox (conn C) ──► socket C
//! ```
//!
//! Every command runs to completion before the next is read, so the registry
//! needs no lock. Outboxes are bounded and filled with `try_send`: the relay
//! never waits on a slow peer. A send into a closed or full outbox counts as
//! that connection's disconnect.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::ProtocolError;
use crate::protocol::{ClientEvent, ConnectionId, Participant, ServerEvent, SessionId};
use crate::relay::{Delivery, Relay, RelayStats};

/// Errors surfaced by the relay service and its transports.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay service is not running")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Events queued per connection before it is evicted as stalled.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Receiving end of a connection's outbox.
pub type EventReceiver = mpsc::Receiver<ServerEvent>;

enum Command {
    Connect {
        reply: oneshot::Sender<(ConnectionId, EventReceiver)>,
    },
    Event {
        from: ConnectionId,
        event: ClientEvent,
    },
    Disconnect {
        id: ConnectionId,
    },
    Members {
        session_id: SessionId,
        reply: oneshot::Sender<Vec<Participant>>,
    },
    Stats {
        reply: oneshot::Sender<RelayStats>,
    },
    Shutdown,
}

/// Cloneable handle to a running relay service.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl RelayHandle {
    /// Register a new transport connection.
    ///
    /// Returns the assigned id and the stream of events addressed to it.
    /// The stream ends when the connection is torn down or the relay stops.
    pub async fn connect(&self) -> Result<(ConnectionId, EventReceiver), RelayError> {
        let (reply, accepted) = oneshot::channel();
        self.send(Command::Connect { reply })?;
        accepted.await.map_err(|_| RelayError::Closed)
    }

    /// Queue an inbound event from `from`. Does not wait for processing.
    pub fn submit(&self, from: ConnectionId, event: ClientEvent) -> Result<(), RelayError> {
        self.send(Command::Event { from, event })
    }

    /// Report that a connection's transport went away.
    pub fn disconnect(&self, id: ConnectionId) -> Result<(), RelayError> {
        self.send(Command::Disconnect { id })
    }

    /// Snapshot of a session's roster, ordered after every queued command.
    pub async fn members(&self, session_id: impl Into<SessionId>) -> Result<Vec<Participant>, RelayError> {
        let (reply, members) = oneshot::channel();
        self.send(Command::Members {
            session_id: session_id.into(),
            reply,
        })?;
        members.await.map_err(|_| RelayError::Closed)
    }

    pub async fn stats(&self) -> Result<RelayStats, RelayError> {
        let (reply, stats) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        stats.await.map_err(|_| RelayError::Closed)
    }

    /// Stop the service after the commands already queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the service has stopped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    fn send(&self, command: Command) -> Result<(), RelayError> {
        self.tx.send(command).map_err(|_| RelayError::Closed)
    }
}

/// The relay event loop.
pub struct RelayService {
    relay: Relay,
    outboxes: HashMap<ConnectionId, mpsc::Sender<ServerEvent>>,
    outbox_capacity: usize,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl RelayService {
    /// Create a service and its handle without starting it.
    pub fn new() -> (Self, RelayHandle) {
        Self::with_outbox_capacity(DEFAULT_OUTBOX_CAPACITY)
    }

    /// Create a service whose connections may each have at most
    /// `outbox_capacity` undelivered events.
    pub fn with_outbox_capacity(outbox_capacity: usize) -> (Self, RelayHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            relay: Relay::new(),
            outboxes: HashMap::new(),
            outbox_capacity: outbox_capacity.max(1),
            rx,
        };
        (service, RelayHandle { tx })
    }

    /// Create and spawn a service on the current Tokio runtime.
    pub fn spawn() -> (RelayHandle, JoinHandle<()>) {
        Self::spawn_with_outbox_capacity(DEFAULT_OUTBOX_CAPACITY)
    }

    pub fn spawn_with_outbox_capacity(outbox_capacity: usize) -> (RelayHandle, JoinHandle<()>) {
        let (service, handle) = Self::with_outbox_capacity(outbox_capacity);
        let task = tokio::spawn(service.run());
        (handle, task)
    }

    /// Process commands until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        log::info!("Relay service started");
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Connect { reply } => {
                    let id = self.relay.connect();
                    let (outbox, events) = mpsc::channel(self.outbox_capacity);
                    if reply.send((id, events)).is_ok() {
                        self.outboxes.insert(id, outbox);
                    } else {
                        // Caller gave up before learning its id.
                        self.relay.disconnect(id);
                    }
                }
                Command::Event { from, event } => {
                    let deliveries = self.relay.dispatch(from, event);
                    self.deliver(deliveries);
                }
                Command::Disconnect { id } => self.teardown(id),
                Command::Members { session_id, reply } => {
                    let _ = reply.send(self.relay.members(&session_id));
                }
                Command::Stats { reply } => {
                    let _ = reply.send(self.relay.stats());
                }
                Command::Shutdown => break,
            }
        }

        let stats = self.relay.stats();
        log::info!(
            "Relay service stopped ({} connections, {} sessions dropped)",
            stats.active_connections,
            stats.active_sessions
        );
    }

    fn teardown(&mut self, id: ConnectionId) {
        self.outboxes.remove(&id);
        let deliveries = self.relay.disconnect(id);
        self.deliver(deliveries);
    }

    /// Push deliveries into outboxes; closed or full outboxes are torn down,
    /// which may produce further LEFT deliveries.
    fn deliver(&mut self, deliveries: Vec<Delivery>) {
        let mut pending = deliveries;
        while !pending.is_empty() {
            let mut failed = Vec::new();
            for Delivery { to, event } in pending.drain(..) {
                if failed.contains(&to) {
                    continue;
                }
                let Some(outbox) = self.outboxes.get(&to) else {
                    continue;
                };
                match outbox.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        log::warn!(
                            "Outbox for {to} is full ({} events), evicting",
                            self.outbox_capacity
                        );
                        failed.push(to);
                    }
                    Err(TrySendError::Closed(_)) => {
                        log::warn!("Send to {to} failed, treating as disconnect");
                        failed.push(to);
                    }
                }
            }
            for id in failed {
                self.outboxes.remove(&id);
                pending.extend(self.relay.disconnect(id));
            }
        }
    }
}
