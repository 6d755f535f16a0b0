//! `GET /health`: liveness/readiness probe for the node, independent of the
//! router heartbeat. Always 200 so orchestrators don't restart a node that's
//! merely still syncing; readiness is surfaced in the body instead.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let engines = state.engine_registry.all().await;
    let mut healthy = 0usize;
    for engine in &engines {
        if engine.health_check().await.is_ok() {
            healthy += 1;
        }
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "ready": state.is_ready(),
            "active_requests": state.active_request_count(),
            "engines_total": engines.len(),
            "engines_healthy": healthy,
        })),
    )
}
