use std::sync::Arc;

use axum::{Router, middleware, routing::get};

use crate::{
    app_state::AppState,
    handlers::conversations::{list_conversations, list_messages},
    middleware::auth::require_principal,
};

/// Conversation history endpoints, all behind bearer authentication.
pub fn create_api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/conversations", get(list_conversations))
        .route("/conversations/{id}/messages", get(list_messages))
        .route_layer(middleware::from_fn_with_state(state, require_principal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::history_store::HistoryStore;
    use crate::testing::{Harness, ScriptedCompletion};
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use serde_json::Value;
    use shared::models::MessageRole;
    use tower::ServiceExt;

    fn app(harness: &Harness) -> Router {
        let state = harness.app_state();
        Router::new()
            .nest("/api", create_api_router(state.clone()))
            .with_state(state)
    }

    async fn get(app: Router, uri: &str, bearer: Option<&str>) -> (StatusCode, Value) {
        let mut request = Request::builder().uri(uri);
        if let Some(bearer) = bearer {
            request = request.header(header::AUTHORIZATION, format!("Bearer {bearer}"));
        }
        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn requires_a_valid_bearer_credential() {
        let harness = Harness::new(ScriptedCompletion::replying(&[]));

        let (status, body) = get(app(&harness), "/api/conversations", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthorized");

        let (status, _) = get(app(&harness), "/api/conversations", Some("not-an-email")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn lists_own_conversations_most_recent_first() {
        let harness = Harness::new(ScriptedCompletion::replying(&[]));
        let older = harness
            .history
            .create_conversation("a@b.com", "Older")
            .await
            .unwrap();
        let newer = harness
            .history
            .create_conversation("a@b.com", "Newer")
            .await
            .unwrap();
        harness
            .history
            .create_conversation("c@d.com", "Someone else")
            .await
            .unwrap();

        let (status, body) = get(app(&harness), "/api/conversations", Some("a@b.com")).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec![newer.id.to_string(), older.id.to_string()]);
        assert!(body[0].get("updatedAt").is_some());
    }

    #[tokio::test]
    async fn messages_are_ordered_and_ownership_checked() {
        let harness = Harness::new(ScriptedCompletion::replying(&[]));
        let conversation = harness
            .history
            .create_conversation("a@b.com", "Mine")
            .await
            .unwrap();
        for (role, content) in [(MessageRole::User, "q"), (MessageRole::Assistant, "a")] {
            harness
                .history
                .append_message("a@b.com", conversation.id, role, content)
                .await
                .unwrap();
        }
        let uri = format!("/api/conversations/{}/messages", conversation.id);

        let (status, body) = get(app(&harness), &uri, Some("a@b.com")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["role"], "user");
        assert_eq!(body[1]["content"], "a");

        let (status, body) = get(app(&harness), &uri, Some("c@d.com")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "forbidden");

        let missing = format!("/api/conversations/{}/messages", uuid::Uuid::new_v4());
        let (status, _) = get(app(&harness), &missing, Some("a@b.com")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
