use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Serialize;
use tracing::warn;

use crate::{app_state::AppState, services::history_store::HistoryStore};

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
}

async fn healthz() -> impl IntoResponse {
    metrics::counter!("health_checks_total", "endpoint" => "healthz", "status" => "ok")
        .increment(1);
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.history.ready().await {
        Ok(()) => {
            metrics::counter!("health_checks_total", "endpoint" => "readyz", "status" => "ok")
                .increment(1);
            (StatusCode::OK, Json(HealthResponse { status: "ready" }))
        }
        Err(err) => {
            warn!(error = %err, "history store is not ready");
            metrics::counter!(
                "health_checks_total",
                "endpoint" => "readyz",
                "status" => "error"
            )
            .increment(1);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse { status: "degraded" }),
            )
        }
    }
}

pub fn create_health_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, ScriptedCompletion};
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    async fn get_status(app: Router, uri: &str) -> StatusCode {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let harness = Harness::new(ScriptedCompletion::replying(&[]));
        let app = create_health_router().with_state(harness.app_state());
        assert_eq!(get_status(app, "/healthz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_reflects_store_readiness() {
        let harness = Harness::new(ScriptedCompletion::replying(&[]));
        let app = create_health_router().with_state(harness.app_state());
        assert_eq!(get_status(app.clone(), "/readyz").await, StatusCode::OK);

        harness.history.fail_readiness();
        assert_eq!(
            get_status(app, "/readyz").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
