//! Outbound message renderers.
//!
//! Each renderer accumulates domain events for one outbound message and can
//! produce its final HTML at any time. Renders are repeatable: the renderer
//! hashes its last output (SHA-256) and reports whether the text changed, so
//! a caller can skip a no-op edit against the destination.

pub mod chat;
pub mod prediction;
pub mod state_update;

pub use chat::{ChatBatchMessage, ChatBuffer};
pub use prediction::PredictionMessage;
pub use state_update::StateUpdateMessage;

use sha2::{Digest, Sha256};

/// Which notification pipeline a message belongs to. Chat-kind sends are the
/// only ones subject to the adaptive flow-control delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    StateUpdate,
    Prediction,
    Chat,
}

impl MessageKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::StateUpdate => "state-update",
            Self::Prediction => "prediction",
            Self::Chat => "chat",
        }
    }
}

/// Result of one render pass.
#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub text: String,
    /// False when the text is byte-identical to the previous render.
    pub has_text_changed: bool,
    /// Link previews are suppressed unless the message embeds its own
    /// preview anchor.
    pub disable_web_page_preview: bool,
}

/// A renderer the delivery loop can drive.
pub trait OutboundMessage: Send {
    fn kind(&self) -> MessageKind;
    fn render(&mut self) -> RenderedMessage;
}

/// A piece of already-escaped HTML plus the number of visible characters it
/// contributes to the message budget.
#[derive(Debug, Clone)]
pub struct RenderedText {
    pub text: String,
    pub raw_len: usize,
}

pub(crate) fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Track whether a renderer's output changed between passes.
#[derive(Debug, Default)]
pub(crate) struct TextChangeTracker {
    last_hash: String,
}

impl TextChangeTracker {
    /// Record this pass's text; returns true when it differs from the last.
    pub(crate) fn update(&mut self, text: &str) -> bool {
        let hash = text_hash(text);
        let changed = self.last_hash != hash;
        self.last_hash = hash;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_tracker_reports_first_and_real_changes_only() {
        let mut tracker = TextChangeTracker::default();
        assert!(tracker.update("a"));
        assert!(!tracker.update("a"));
        assert!(tracker.update("b"));
        assert!(!tracker.update("b"));
    }
}
