//! `GET /health`: liveness probe.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::AppState;

/// Always `200 OK` with `{ "status": "ok", "started_at": "<rfc3339>" }`.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "started_at": state.started_at(),
    }))
}
