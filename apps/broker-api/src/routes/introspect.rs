//! Read-only views over the membership registry.
//!
//! Each handler takes one snapshot through the broker's mailbox and never
//! mutates state.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use crate::broker::registry::RegistrySnapshot;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/clients", get(clients))
        .route("/groups", get(groups))
        .route("/sessions", get(sessions))
}

async fn snapshot(state: &AppState) -> Result<RegistrySnapshot, StatusCode> {
    state
        .broker
        .snapshot()
        .await
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)
}

/// Total session count, as plain text.
async fn status(State(state): State<AppState>) -> Result<String, StatusCode> {
    Ok(snapshot(&state).await?.sessions.len().to_string())
}

/// Session id to the groups its connection currently belongs to.
async fn clients(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, Vec<String>>>, StatusCode> {
    Ok(Json(snapshot(&state).await?.clients))
}

/// Group name to the session ids of its current members.
async fn groups(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, Vec<String>>>, StatusCode> {
    Ok(Json(snapshot(&state).await?.groups))
}

/// All registered session ids.
async fn sessions(State(state): State<AppState>) -> Result<Json<Vec<String>>, StatusCode> {
    Ok(Json(snapshot(&state).await?.sessions))
}
