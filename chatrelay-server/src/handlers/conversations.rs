use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, State},
};
use tracing::instrument;
use uuid::Uuid;

use shared::models::{ConversationSummary, Principal, StoredMessage};

use crate::{
    app_state::AppState, http::error::AppResult, services::history_store::HistoryStore,
};

/// Lists the caller's conversations, most recently updated first.
#[instrument(skip_all, fields(principal = %principal))]
pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> AppResult<Json<Vec<ConversationSummary>>> {
    let conversations = state.history.list_conversations(&principal.id).await?;
    Ok(Json(conversations))
}

/// Ordered messages of one conversation owned by the caller.
#[instrument(skip_all, fields(principal = %principal, conversation = %id))]
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<StoredMessage>>> {
    let messages = state.history.list_messages(&principal.id, id).await?;
    Ok(Json(messages))
}
