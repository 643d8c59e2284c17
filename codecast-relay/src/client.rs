//! WebSocket client implementing the participant side of the protocol.
//!
//! Provides:
//! - Connection lifecycle (connect, join, disconnect)
//! - Roster tracking, replaced wholesale on every JOINED
//! - Local/remote edit separation so applied edits are never re-broadcast
//! - Automatic SYNC of the local buffer to newly joined peers
//!
//! ```text
//! app ── edit() ──► SharedBuffer ──► CHANGE ──► writer task ──► relay
//! app ◄── ShellEvent ◄── reader task ◄── JOINED / LEFT / CHANGE / SYNC ◄── relay
//!                             │
//!                             └── SYNC to new peer ──► writer task
//! ```

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;

use crate::buffer::SharedBuffer;
use crate::codec::Codec;
use crate::protocol::{ClientEvent, ConnectionId, Participant, ServerEvent, SessionId};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Not connected")]
    NotConnected,
    #[error("{0} is required")]
    MissingField(&'static str),
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    /// Member of a session
    Joined,
}

/// Notifications for the application hosting the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// Transport is up
    Connected,
    /// Our own join was processed
    Joined {
        connection_id: ConnectionId,
        members: Vec<Participant>,
    },
    /// Someone else joined the session
    PeerJoined(Participant),
    /// A member left the session
    PeerLeft(Participant),
    /// Buffer content was replaced by a peer's version
    BufferReplaced(String),
    /// Transport closed
    Disconnected,
}

/// Participant-side protocol state.
#[derive(Debug)]
struct ShellState {
    connection: ClientState,
    own_id: Option<ConnectionId>,
    roster: Vec<Participant>,
    buffer: SharedBuffer,
}

impl ShellState {
    fn new() -> Self {
        Self {
            connection: ClientState::Disconnected,
            own_id: None,
            roster: Vec::new(),
            buffer: SharedBuffer::new(),
        }
    }

    /// Apply one relay event; returns notifications and events to send back.
    fn apply(&mut self, event: ServerEvent) -> (Vec<ShellEvent>, Vec<ClientEvent>) {
        let mut notify = Vec::new();
        let mut reply = Vec::new();

        match event {
            ServerEvent::Joined {
                members,
                display_name,
                connection_id,
            } => {
                // The first JOINED after our own JOIN is always ours: we are
                // not a member of anything before it is processed.
                let own = *self.own_id.get_or_insert(connection_id);
                let known = self.roster.iter().any(|p| p.connection_id == connection_id);
                self.roster = members;

                if own == connection_id {
                    self.connection = ClientState::Joined;
                    notify.push(ShellEvent::Joined {
                        connection_id,
                        members: self.roster.clone(),
                    });
                } else if !known {
                    notify.push(ShellEvent::PeerJoined(Participant::new(
                        connection_id,
                        display_name,
                    )));
                    reply.extend(self.buffer.sync_for(connection_id));
                }
            }
            ServerEvent::Left {
                connection_id,
                display_name,
            } => {
                self.roster.retain(|p| p.connection_id != connection_id);
                notify.push(ShellEvent::PeerLeft(Participant::new(
                    connection_id,
                    display_name,
                )));
            }
            ServerEvent::Change { code } | ServerEvent::Sync { code, .. } => {
                if self.buffer.apply_remote(code.clone()) {
                    notify.push(ShellEvent::BufferReplaced(code));
                }
            }
        }

        (notify, reply)
    }

    fn reset(&mut self) {
        self.connection = ClientState::Disconnected;
        self.own_id = None;
        self.roster.clear();
    }
}

/// The relay client.
pub struct RelayClient {
    server_url: String,
    codec: Codec,
    state: Arc<Mutex<ShellState>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::UnboundedSender<ClientEvent>>,
    event_tx: mpsc::Sender<ShellEvent>,
    event_rx: Option<mpsc::Receiver<ShellEvent>>,
}

impl RelayClient {
    /// Create a client for the relay at `server_url` (e.g. `ws://127.0.0.1:5000`).
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            codec: Codec::Json,
            state: Arc::new(Mutex::new(ShellState::new())),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Use `codec` for outgoing frames.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ShellEvent>> {
        self.event_rx.take()
    }

    /// Connect to the relay.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        self.state.lock().await.connection = ClientState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                self.state.lock().await.connection = ClientState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        // The reader only holds a weak sender so that `disconnect` closes the writer.
        let sync_tx = out_tx.downgrade();
        self.outgoing_tx = Some(out_tx);

        // Writer task: forward outgoing events to the socket.
        let codec = self.codec;
        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let frame = match codec.encode(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("Dropping {}: {e}", event.name());
                        continue;
                    }
                };
                if ws_writer.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        self.state.lock().await.connection = ClientState::Connected;
        let _ = self.event_tx.send(ShellEvent::Connected).await;

        // Reader task: apply relay events to the local state.
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let msg = match msg {
                    Ok(msg @ (Message::Text(_) | Message::Binary(_))) => msg,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let event = match Codec::decode::<ServerEvent>(&msg) {
                    Ok((_, event)) => event,
                    Err(e) => {
                        log::warn!("Ignoring undecodable frame from relay: {e}");
                        continue;
                    }
                };

                let (notify, reply) = state.lock().await.apply(event);
                if let Some(tx) = sync_tx.upgrade() {
                    for event in reply {
                        let _ = tx.send(event);
                    }
                }
                for event in notify {
                    let _ = event_tx.send(event).await;
                }
            }

            // Connection lost
            state.lock().await.reset();
            let _ = event_tx.send(ShellEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Join (or create) a session. Both fields must be non-empty.
    pub async fn join(
        &self,
        session_id: impl Into<SessionId>,
        display_name: impl Into<String>,
    ) -> Result<(), ClientError> {
        let session_id = session_id.into();
        let display_name = display_name.into();
        if session_id.is_empty() {
            return Err(ClientError::MissingField("session id"));
        }
        if display_name.is_empty() {
            return Err(ClientError::MissingField("display name"));
        }
        self.send(ClientEvent::Join {
            session_id,
            display_name,
        })
    }

    /// Record a local edit and broadcast it if the content changed.
    ///
    /// Before joining, the edit only updates the local buffer. Returns
    /// whether a CHANGE was sent.
    pub async fn edit(&self, text: impl Into<String>) -> Result<bool, ClientError> {
        let change = {
            let mut state = self.state.lock().await;
            let change = state.buffer.apply_local(text);
            change.filter(|_| state.connection == ClientState::Joined)
        };
        match change {
            Some(event) => self.send(event).map(|_| true),
            None => Ok(false),
        }
    }

    /// Close the connection. The reader emits [`ShellEvent::Disconnected`].
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    /// Current roster as last announced by the relay.
    pub async fn members(&self) -> Vec<Participant> {
        self.state.lock().await.roster.clone()
    }

    /// Current buffer content.
    pub async fn buffer_text(&self) -> String {
        self.state.lock().await.buffer.text().to_string()
    }

    /// Our relay-assigned id, once joined.
    pub async fn connection_id(&self) -> Option<ConnectionId> {
        self.state.lock().await.own_id
    }

    pub async fn connection_state(&self) -> ClientState {
        self.state.lock().await.connection
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn send(&self, event: ClientEvent) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(event).map_err(|_| ClientError::NotConnected)
    }
}
