use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use shared::models::{ConversationId, ConversationSummary, MessageRole, StoredMessage};

use super::history_store::{HistoryError, HistoryResult, HistoryStore};
use crate::db::bootstrap;

/// History store backed by the `chatrelay` Postgres schema.
#[derive(Debug, Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: Uuid,
    title: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ConversationRow> for ConversationSummary {
    fn from(row: ConversationRow) -> Self {
        Self {
            id: row.id,
            title: row.title,
            created_at: row.created_at.into(),
            updated_at: row.updated_at.into(),
        }
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    role: String,
    content: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for StoredMessage {
    type Error = HistoryError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let role = MessageRole::try_from(row.role.as_str())
            .map_err(|_| HistoryError::Corrupt(format!("unknown role '{}'", row.role)))?;
        Ok(Self {
            role,
            content: row.content,
            created_at: row.created_at.into(),
        })
    }
}

impl PgHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_owner(&self, owner: &str, id: ConversationId) -> HistoryResult<()> {
        let found: Option<String> =
            sqlx::query_scalar("SELECT owner_id FROM chatrelay.conversations WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match found {
            None => Err(HistoryError::NotFound(id)),
            Some(actual) if actual != owner => Err(HistoryError::Forbidden(id)),
            Some(_) => Ok(()),
        }
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn create_conversation(
        &self,
        owner: &str,
        title: &str,
    ) -> HistoryResult<ConversationSummary> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "INSERT INTO chatrelay.conversations (id, owner_id, title) \
             VALUES ($1, $2, $3) \
             RETURNING id, title, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(owner)
        .bind(title)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn touch_conversation(&self, owner: &str, id: ConversationId) -> HistoryResult<()> {
        let result = sqlx::query(
            "UPDATE chatrelay.conversations SET updated_at = clock_timestamp() \
             WHERE id = $1 AND owner_id = $2",
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing conversation from a foreign one.
            self.ensure_owner(owner, id).await?;
        }
        Ok(())
    }

    async fn append_message(
        &self,
        owner: &str,
        id: ConversationId,
        role: MessageRole,
        content: &str,
    ) -> HistoryResult<StoredMessage> {
        self.ensure_owner(owner, id).await?;

        let row = sqlx::query_as::<_, MessageRow>(
            "INSERT INTO chatrelay.messages (conversation_id, role, content) \
             VALUES ($1, $2, $3) \
             RETURNING role, content, created_at",
        )
        .bind(id)
        .bind(role.as_str())
        .bind(content)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn list_messages(
        &self,
        owner: &str,
        id: ConversationId,
    ) -> HistoryResult<Vec<StoredMessage>> {
        self.ensure_owner(owner, id).await?;

        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT role, content, created_at FROM chatrelay.messages \
             WHERE conversation_id = $1 \
             ORDER BY created_at ASC, seq ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredMessage::try_from).collect()
    }

    async fn list_conversations(&self, owner: &str) -> HistoryResult<Vec<ConversationSummary>> {
        let rows = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, title, created_at, updated_at FROM chatrelay.conversations \
             WHERE owner_id = $1 \
             ORDER BY updated_at DESC, created_at DESC",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ConversationSummary::from).collect())
    }

    async fn get_conversation(
        &self,
        owner: &str,
        id: ConversationId,
    ) -> HistoryResult<ConversationSummary> {
        self.ensure_owner(owner, id).await?;

        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, title, created_at, updated_at FROM chatrelay.conversations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ConversationSummary::from)
            .ok_or(HistoryError::NotFound(id))
    }

    async fn ready(&self) -> HistoryResult<()> {
        bootstrap::ensure_readiness(&self.pool).await?;
        Ok(())
    }
}
