use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use tracing::{debug, instrument};

use crate::{
    app_state::AppState, http::error::ApiError, services::identity::IdentityVerifier,
};

/// Resolves `Authorization: Bearer <credential>` to a [`shared::models::Principal`]
/// request extension, interpreting the credential per the configured auth mode.
#[instrument(skip_all, fields(path = %req.uri().path()))]
pub async fn require_principal(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let raw = bearer_credential(req.headers())
        .ok_or_else(|| ApiError::unauthorized("missing bearer credential"))?;

    let credential = state.verifier.credential_from_raw(raw);
    let principal = state.verifier.verify(&credential).await?;
    debug!(principal = %principal, "request authenticated");

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

fn bearer_credential(headers: &axum::http::HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, credential) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let credential = credential.trim();
    (!credential.is_empty()).then(|| credential.to_string())
}
