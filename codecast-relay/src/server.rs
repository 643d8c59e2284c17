//! WebSocket transport for the relay.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── outbox A ──► Client A
//!             ├── connection tasks ──► RelayService
//! Client B ──┘   (decode, submit)       └── outbox B ──► Client B
//! ```
//!
//! Each accepted socket gets one task that decodes inbound frames into
//! [`ClientEvent`]s, forwards its outbox to the socket, and reports the
//! disconnect when either side closes.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

use crate::codec::Codec;
use crate::protocol::ClientEvent;
use crate::relay::RelayStats;
use crate::service::{RelayError, RelayHandle, RelayService, DEFAULT_OUTBOX_CAPACITY};

/// Environment variable overriding [`ServerConfig::bind_addr`].
pub const ENV_BIND_ADDR: &str = "CODECAST_BIND_ADDR";
/// Environment variable overriding [`ServerConfig::max_message_bytes`].
pub const ENV_MAX_MESSAGE_BYTES: &str = "CODECAST_MAX_MESSAGE_BYTES";
/// Environment variable overriding [`ServerConfig::outbox_capacity`].
pub const ENV_OUTBOX_CAPACITY: &str = "CODECAST_OUTBOX_CAPACITY";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Largest accepted WebSocket message/frame, in bytes
    pub max_message_bytes: usize,
    /// Undelivered events per connection before it is evicted
    pub outbox_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            max_message_bytes: 1 << 20,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `CODECAST_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// Unparseable numbers keep the default and log a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup(ENV_BIND_ADDR).filter(|a| !a.trim().is_empty()) {
            config.bind_addr = addr.trim().to_string();
        }

        if let Some(n) = positive(&lookup, ENV_MAX_MESSAGE_BYTES, config.max_message_bytes) {
            config.max_message_bytes = n;
        }
        if let Some(n) = positive(&lookup, ENV_OUTBOX_CAPACITY, config.outbox_capacity) {
            config.outbox_capacity = n;
        }

        config
    }

    fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_message_bytes))
            .max_frame_size(Some(self.max_message_bytes))
    }
}

/// Parse a positive integer variable, warning and returning `None` otherwise.
fn positive(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: usize) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            log::warn!("Ignoring {key}={raw:?}, using {current}");
            None
        }
    }
}

/// The relay server: a relay service plus a WebSocket accept loop.
pub struct RelayServer {
    config: ServerConfig,
    relay: RelayHandle,
    service: JoinHandle<()>,
}

impl RelayServer {
    /// Create a server and start its relay service.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let (relay, service) = RelayService::spawn_with_outbox_capacity(config.outbox_capacity);
        Self {
            config,
            relay,
            service,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind to the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until the relay is shut down.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("Relay server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::error!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let relay = self.relay.clone();
                    let ws_config = self.config.websocket_config();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, relay, ws_config).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = self.relay.closed() => {
                    log::info!("Relay stopped, no longer accepting connections");
                    return Ok(());
                }
            }
        }
    }

    /// Stop the relay; open connections are closed and `serve` returns.
    pub fn shutdown(&self) {
        self.relay.shutdown();
    }

    /// Handle to the relay service behind this server.
    pub fn relay(&self) -> &RelayHandle {
        &self.relay
    }

    pub async fn stats(&self) -> Result<RelayStats, RelayError> {
        self.relay.stats().await
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Whether the relay service task has exited.
    pub fn is_finished(&self) -> bool {
        self.service.is_finished()
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    relay: RelayHandle,
    ws_config: WebSocketConfig,
) -> Result<(), RelayError> {
    let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (id, mut outbox) = relay.connect().await?;
    log::info!("WebSocket connection {id} established from {addr}");

    // Reply in whatever codec the peer last used.
    let mut codec = Codec::default();

    let result: Result<(), RelayError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                            match Codec::decode::<ClientEvent>(&msg) {
                                Ok((used, event)) => {
                                    codec = used;
                                    log::debug!("{id} sent {}", event.name());
                                    relay.submit(id, event)?;
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {id} closed from {addr}");
                            return Ok(());
                        }

                        Some(Ok(_)) => {}

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }
                    }
                }

                event = outbox.recv() => {
                    match event {
                        Some(event) => {
                            ws_sender.send(codec.encode(&event)?).await?;
                        }
                        None => {
                            // Relay tore the connection down or stopped.
                            let _ = ws_sender.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
    .await;

    // Both clean and failed exits end the membership.
    let _ = relay.disconnect(id);
    result
}
