//! # Completion Type Definitions

use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, MessageRole};

/// Ordered message history submitted to a completion source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionRequest {
    /// Messages in prompt order; the first is the system instruction
    pub messages: Vec<ChatMessage>,

    /// Maximum tokens to generate for this request
    pub max_completion_tokens: Option<u32>,

    /// Temperature override for this request
    pub temperature: Option<f32>,

    /// Top-p override for this request
    pub top_p: Option<f32>,
}

impl CompletionRequest {
    /// Create a new request with provider defaults
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_completion_tokens: None,
            temperature: None,
            top_p: None,
        }
    }

    /// Set the maximum tokens
    #[must_use]
    pub fn with_max_completion_tokens(mut self, max_tokens: u32) -> Self {
        self.max_completion_tokens = Some(max_tokens);
        self
    }

    /// Set the temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set top-p
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// The most recent user turn, if any
    #[must_use]
    pub fn last_user_message(&self) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::User)
    }
}
