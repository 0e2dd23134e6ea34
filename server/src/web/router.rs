use std::sync::Arc;

use axum::extract::State;
use axum::{Json, Router};
use serde_json::{Value, json};

use super::app_state::AppState;
use super::ws_handler;

/// Build the axum router with the WebSocket gateway and a health probe.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", axum::routing::get(ws_handler::ws_upgrade))
        .route("/health", axum::routing::get(health))
        .with_state(state)
}

/// Liveness plus the number of open store connections.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.store.connection_count(),
    }))
}
