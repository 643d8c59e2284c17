//! Participant-side copy of the shared buffer.
//!
//! The relay keeps no buffer; each participant holds one and reconciles it by
//! last-write-wins replacement. Edits are tagged with their origin so an
//! applied remote edit is never re-broadcast as a new change.

use crate::protocol::{ClientEvent, ConnectionId};

/// Who produced the buffer's current content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EditOrigin {
    /// Nothing written yet
    #[default]
    Empty,
    /// Typed by this participant
    Local,
    /// Applied from a peer's CHANGE or SYNC
    Remote,
}

/// Local buffer with origin tracking.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    text: String,
    origin: EditOrigin,
    revision: u64,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local edit.
    ///
    /// Returns the CHANGE to broadcast, or `None` when the content is
    /// unchanged (e.g. an editor echoing back a remote replacement).
    pub fn apply_local(&mut self, text: impl Into<String>) -> Option<ClientEvent> {
        let text = text.into();
        if text == self.text {
            return None;
        }
        self.replace(text.clone(), EditOrigin::Local);
        Some(ClientEvent::change(text))
    }

    /// Replace content with a peer's version. Never produces an outbound
    /// event. Returns whether the content changed.
    pub fn apply_remote(&mut self, text: impl Into<String>) -> bool {
        let text = text.into();
        if text == self.text {
            return false;
        }
        self.replace(text, EditOrigin::Remote);
        true
    }

    /// SYNC carrying the current content to `target`; `None` while empty.
    pub fn sync_for(&self, target: ConnectionId) -> Option<ClientEvent> {
        if self.text.is_empty() {
            return None;
        }
        Some(ClientEvent::sync(self.text.clone(), target))
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn origin(&self) -> EditOrigin {
        self.origin
    }

    /// Number of content replacements so far.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn replace(&mut self, text: String, origin: EditOrigin) {
        self.text = text;
        self.origin = origin;
        self.revision += 1;
    }
}
