//! Worker list handler.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};

use crate::orchestrator::Orchestrator;

/// List worker slots as JSON.
pub async fn list_workers(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(orchestrator.workers())
}
