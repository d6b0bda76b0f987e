//! Process liveness probe. Says nothing about registry or bus state; the
//! introspection routes cover those.

use axum::routing::get;
use axum::{Json, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// Always-ok liveness check for the broker process.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": "broker-api" }))
}
