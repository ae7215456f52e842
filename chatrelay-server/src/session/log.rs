use std::sync::Arc;

use shared::models::{ChatMessage, MessageRole, StoredMessage, Timestamp};

/// Append-only message log with point-in-time snapshots.
///
/// Guest sessions keep their history here instead of in the history store.
#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    entries: Vec<Arc<StoredMessage>>,
}

impl MessageLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, role: MessageRole, content: impl Into<String>) {
        self.entries.push(Arc::new(StoredMessage {
            role,
            content: content.into(),
            created_at: Timestamp::now(),
        }));
    }

    /// Copies the log as it stands now; later appends do not affect it.
    #[must_use]
    pub fn snapshot(&self) -> Vec<StoredMessage> {
        self.entries.iter().map(|entry| (**entry).clone()).collect()
    }

    /// The snapshot in the shape sent upstream.
    #[must_use]
    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        self.entries
            .iter()
            .map(|entry| entry.to_chat_message())
            .collect()
    }

    #[must_use]
    pub fn first_user_message(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.role == MessageRole::User)
            .map(|entry| entry.content.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
