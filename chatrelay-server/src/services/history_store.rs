//! Durable conversation history.
//!
//! Every per-conversation call takes the owner id and enforces ownership, so
//! callers never have to remember a separate access check.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use shared::models::{ConversationId, ConversationSummary, MessageRole, StoredMessage, Timestamp};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("conversation {0} not found")]
    NotFound(ConversationId),
    #[error("conversation {0} belongs to another principal")]
    Forbidden(ConversationId),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored data is invalid: {0}")]
    Corrupt(String),
}

pub type HistoryResult<T> = Result<T, HistoryError>;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn create_conversation(&self, owner: &str, title: &str)
    -> HistoryResult<ConversationSummary>;

    /// Bumps the conversation's `updated_at`.
    async fn touch_conversation(&self, owner: &str, id: ConversationId) -> HistoryResult<()>;

    async fn append_message(
        &self,
        owner: &str,
        id: ConversationId,
        role: MessageRole,
        content: &str,
    ) -> HistoryResult<StoredMessage>;

    /// Messages in ascending creation order, insertion order breaking ties.
    async fn list_messages(&self, owner: &str, id: ConversationId)
    -> HistoryResult<Vec<StoredMessage>>;

    /// Conversations most-recently-updated first.
    async fn list_conversations(&self, owner: &str) -> HistoryResult<Vec<ConversationSummary>>;

    async fn get_conversation(&self, owner: &str, id: ConversationId)
    -> HistoryResult<ConversationSummary>;

    /// Whether the backing store can serve requests.
    async fn ready(&self) -> HistoryResult<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct StoredConversation {
    owner: String,
    summary: ConversationSummary,
    messages: Vec<StoredMessage>,
    // Breaks `updated_at` ties so recency ordering is deterministic.
    revision: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, StoredConversation>,
    revision: u64,
}

impl MemoryState {
    fn owned_mut(
        &mut self,
        owner: &str,
        id: ConversationId,
    ) -> HistoryResult<&mut StoredConversation> {
        let conversation = self
            .conversations
            .get_mut(&id)
            .ok_or(HistoryError::NotFound(id))?;
        if conversation.owner != owner {
            return Err(HistoryError::Forbidden(id));
        }
        Ok(conversation)
    }

    fn owned(&self, owner: &str, id: ConversationId) -> HistoryResult<&StoredConversation> {
        let conversation = self
            .conversations
            .get(&id)
            .ok_or(HistoryError::NotFound(id))?;
        if conversation.owner != owner {
            return Err(HistoryError::Forbidden(id));
        }
        Ok(conversation)
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}

/// Process-local store used when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryHistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn create_conversation(
        &self,
        owner: &str,
        title: &str,
    ) -> HistoryResult<ConversationSummary> {
        let now = Timestamp::now();
        let summary = ConversationSummary {
            id: Uuid::new_v4(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };

        let mut state = self.state.write().await;
        let revision = state.next_revision();
        state.conversations.insert(
            summary.id,
            StoredConversation {
                owner: owner.to_string(),
                summary: summary.clone(),
                messages: Vec::new(),
                revision,
            },
        );
        Ok(summary)
    }

    async fn touch_conversation(&self, owner: &str, id: ConversationId) -> HistoryResult<()> {
        let mut state = self.state.write().await;
        let revision = state.next_revision();
        let conversation = state.owned_mut(owner, id)?;
        conversation.summary.updated_at = Timestamp::now();
        conversation.revision = revision;
        Ok(())
    }

    async fn append_message(
        &self,
        owner: &str,
        id: ConversationId,
        role: MessageRole,
        content: &str,
    ) -> HistoryResult<StoredMessage> {
        let mut state = self.state.write().await;
        let conversation = state.owned_mut(owner, id)?;
        let message = StoredMessage {
            role,
            content: content.to_string(),
            created_at: Timestamp::now(),
        };
        conversation.messages.push(message.clone());
        Ok(message)
    }

    async fn list_messages(
        &self,
        owner: &str,
        id: ConversationId,
    ) -> HistoryResult<Vec<StoredMessage>> {
        let state = self.state.read().await;
        Ok(state.owned(owner, id)?.messages.clone())
    }

    async fn list_conversations(&self, owner: &str) -> HistoryResult<Vec<ConversationSummary>> {
        let state = self.state.read().await;
        let mut owned: Vec<&StoredConversation> = state
            .conversations
            .values()
            .filter(|conversation| conversation.owner == owner)
            .collect();
        owned.sort_by(|a, b| {
            b.summary
                .updated_at
                .cmp(&a.summary.updated_at)
                .then(b.revision.cmp(&a.revision))
        });
        Ok(owned
            .into_iter()
            .map(|conversation| conversation.summary.clone())
            .collect())
    }

    async fn get_conversation(
        &self,
        owner: &str,
        id: ConversationId,
    ) -> HistoryResult<ConversationSummary> {
        let state = self.state.read().await;
        Ok(state.owned(owner, id)?.summary.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_keep_insertion_order() {
        let store = MemoryHistoryStore::new();
        let conversation = store.create_conversation("a@b.com", "Hello").await.unwrap();

        for (role, content) in [
            (MessageRole::User, "one"),
            (MessageRole::Assistant, "two"),
            (MessageRole::User, "three"),
        ] {
            store
                .append_message("a@b.com", conversation.id, role, content)
                .await
                .unwrap();
        }

        let messages = store
            .list_messages("a@b.com", conversation.id)
            .await
            .unwrap();
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
        assert!(messages.windows(2).all(|pair| pair[0].created_at <= pair[1].created_at));
    }

    #[tokio::test]
    async fn ownership_is_enforced() {
        let store = MemoryHistoryStore::new();
        let conversation = store.create_conversation("owner@x.io", "Mine").await.unwrap();

        let err = store
            .list_messages("intruder@x.io", conversation.id)
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::Forbidden(id) if id == conversation.id));

        let err = store
            .append_message("intruder@x.io", conversation.id, MessageRole::User, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::Forbidden(_)));

        let missing = Uuid::new_v4();
        let err = store.get_conversation("owner@x.io", missing).await.unwrap_err();
        assert!(matches!(err, HistoryError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn conversations_list_most_recent_first() {
        let store = MemoryHistoryStore::new();
        let first = store.create_conversation("a@b.com", "First").await.unwrap();
        let second = store.create_conversation("a@b.com", "Second").await.unwrap();
        store.create_conversation("c@d.com", "Other").await.unwrap();

        let listed = store.list_conversations("a@b.com").await.unwrap();
        assert_eq!(
            listed.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![second.id, first.id]
        );

        store.touch_conversation("a@b.com", first.id).await.unwrap();
        let listed = store.list_conversations("a@b.com").await.unwrap();
        assert_eq!(listed[0].id, first.id);
        assert!(listed[0].updated_at >= first.updated_at);
    }
}
