use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;
use tracing::error;

use super::problem::ProblemDetails;
use crate::services::history_store::HistoryError;
use crate::services::identity::IdentityError;

pub type AppResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        ProblemDetails::new(self.status, self.code, self.message).into_response()
    }
}

impl From<HistoryError> for ApiError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::NotFound(id) => Self::not_found(format!("conversation {id} not found")),
            HistoryError::Forbidden(id) => {
                Self::forbidden(format!("conversation {id} belongs to another user"))
            }
            other => {
                metrics::counter!("chatrelay_persistence_failures_total").increment(1);
                error!(error = %other, "history store failure");
                Self::internal_server_error("history store unavailable")
            }
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        tracing::debug!(error = %err, "bearer credential rejected");
        Self::unauthorized("invalid credential")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_TYPE;
    use serde_json::Value;
    use uuid::Uuid;

    #[tokio::test]
    async fn into_response_serializes_problem_details() {
        let response = ApiError::not_found("missing conversation").into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );

        let bytes = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .expect("body to bytes");
        let json: Value = serde_json::from_slice(&bytes).expect("problem json");
        assert_eq!(json["code"], "not_found");
        assert_eq!(json["status"], 404);
        assert_eq!(json["detail"], "missing conversation");
    }

    #[test]
    fn history_errors_map_to_status_codes() {
        let id = Uuid::new_v4();
        assert_eq!(
            ApiError::from(HistoryError::NotFound(id)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(HistoryError::Forbidden(id)).status(),
            StatusCode::FORBIDDEN
        );

        let internal = ApiError::from(HistoryError::Database(sqlx::Error::PoolTimedOut));
        assert_eq!(internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!internal.to_string().contains("PoolTimedOut"));
    }

    #[test]
    fn identity_errors_are_unauthorized() {
        let err = ApiError::from(IdentityError::InvalidEmail);
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }
}
