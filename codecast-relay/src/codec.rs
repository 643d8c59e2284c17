//! Frame codec for protocol events.
//!
//! ```text
//! Text frame   ── JSON   ── {"change":{"code":"..."}}
//! Binary frame ── bincode (standard config, externally tagged enum)
//! ```
//!
//! A peer picks its codec by the frames it sends; the relay replies in kind.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

/// Codec errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unsupported frame kind")]
    UnsupportedFrame,
}

/// Encoding used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// UTF-8 JSON in text frames
    #[default]
    Json,
    /// bincode in binary frames
    Binary,
}

impl Codec {
    /// Encode an event into a WebSocket frame.
    pub fn encode<T: Serialize>(self, event: &T) -> Result<Message, ProtocolError> {
        match self {
            Self::Json => {
                let text = serde_json::to_string(event)
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                Ok(Message::Text(text.into()))
            }
            Self::Binary => {
                let bytes = bincode::serde::encode_to_vec(event, bincode::config::standard())
                    .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
                Ok(Message::Binary(bytes.into()))
            }
        }
    }

    /// Decode a data frame, reporting which codec it used.
    ///
    /// Control frames (ping/pong/close) are not events and yield
    /// [`ProtocolError::UnsupportedFrame`].
    pub fn decode<T: DeserializeOwned>(message: &Message) -> Result<(Self, T), ProtocolError> {
        match message {
            Message::Text(text) => {
                let event = serde_json::from_str(text.as_str())
                    .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
                Ok((Self::Json, event))
            }
            Message::Binary(bytes) => {
                let (event, _) =
                    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
                Ok((Self::Binary, event))
            }
            _ => Err(ProtocolError::UnsupportedFrame),
        }
    }
}
