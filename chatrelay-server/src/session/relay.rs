//! Turns a raw fragment stream into cumulative snapshot events.
//!
//! Each `ai` event carries the whole response accumulated so far, so a
//! client that re-renders from the latest snapshot never sees duplicated or
//! dropped characters, even when a fragment boundary splits a markup token.

use shared::models::OutboundEvent;

#[derive(Debug, Default)]
pub struct DeltaRelay {
    accumulated: String,
    sent_len: usize,
    started: bool,
}

impl DeltaRelay {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fragment and returns the events it produces: `ai_start`
    /// before the first non-empty fragment, then one `ai` snapshot whenever
    /// the accumulated text changed.
    pub fn push(&mut self, fragment: &str) -> Vec<OutboundEvent> {
        if fragment.is_empty() {
            return Vec::new();
        }

        self.accumulated.push_str(fragment);
        let mut events = Vec::with_capacity(2);
        if !self.started {
            self.started = true;
            events.push(OutboundEvent::AiStart);
        }

        // Appending a non-empty fragment always grows the text.
        if self.accumulated.len() != self.sent_len {
            self.sent_len = self.accumulated.len();
            events.push(OutboundEvent::Ai {
                content: self.accumulated.clone(),
            });
        }

        events
    }

    /// Consumes the relay, yielding the text the client was shown.
    #[must_use]
    pub fn finish(self) -> String {
        self.accumulated
    }
}
