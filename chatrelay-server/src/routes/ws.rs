use std::sync::Arc;

use axum::{Router, routing::get};

use crate::{app_state::AppState, handlers::ws::ws_handler};

pub fn create_ws_router() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(ws_handler))
}
