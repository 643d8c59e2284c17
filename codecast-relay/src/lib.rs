//! # codecast-relay — Session relay for shared code editing
//!
//! Participants join a named session and see one shared text buffer change as
//! any member edits it. The relay tracks session membership and forwards
//! buffer events between members; it never holds the buffer itself.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    WebSocket     ┌──────────────┐
//! │ RelayClient  │ ◄──────────────► │ RelayServer  │
//! │ (per user)   │   JSON / bincode │ (transport)  │
//! └──────┬───────┘                  └──────┬───────┘
//!        │                                 │ Command (mpsc)
//!        ▼                                 ▼
//! ┌──────────────┐                  ┌──────────────┐
//! │ SharedBuffer │                  │ RelayService │  one event at a time
//! │ (local copy) │                  └──────┬───────┘
//! └──────────────┘                         │
//!                                   ┌──────┴───────┐
//!                                   │ Relay        │  state machine
//!                                   │  └ Registry  │  session → members
//!                                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Event types and identifiers
//! - [`codec`] — JSON text frames and bincode binary frames
//! - [`registry`] — Session membership bookkeeping
//! - [`relay`] — Per-connection state machine and fan-out rules
//! - [`service`] — Single-task event loop owning the relay
//! - [`server`] — WebSocket accept loop and configuration
//! - [`client`] — Participant-side client
//! - [`buffer`] — Participant-side buffer with edit origin tracking

pub mod protocol;
pub mod codec;
pub mod registry;
pub mod relay;
pub mod service;
pub mod server;
pub mod client;
pub mod buffer;

// Re-exports for convenience
pub use protocol::{ClientEvent, ConnectionId, Participant, ServerEvent, SessionId};
pub use codec::{Codec, ProtocolError};
pub use registry::{Removal, SessionRegistry};
pub use relay::{ConnectionState, Delivery, Relay, RelayStats};
pub use service::{EventReceiver, RelayError, RelayHandle, RelayService, DEFAULT_OUTBOX_CAPACITY};
pub use server::{RelayServer, ServerConfig};
pub use client::{ClientError, ClientState, RelayClient, ShellEvent};
pub use buffer::{EditOrigin, SharedBuffer};
