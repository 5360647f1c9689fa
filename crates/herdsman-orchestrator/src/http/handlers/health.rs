//! Health, history and metrics handlers.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};

use crate::http::responses::{ErrorResponse, HistoryQuery, TrendQuery};
use crate::orchestrator::Orchestrator;

/// Health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    let body = crate::metrics::collect_metrics(&orchestrator);
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

/// Latest resource snapshot.
pub async fn health_snapshot(
    State(orchestrator): State<Arc<Orchestrator>>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    match orchestrator.health_snapshot() {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("no health sample recorded yet")),
        )),
    }
}

/// Recent snapshots, oldest first.
pub async fn health_history(
    State(orchestrator): State<Arc<Orchestrator>>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    Json(orchestrator.health_history(query.limit))
}

/// Average and peak per resource over the most recent samples.
pub async fn health_trend(
    State(orchestrator): State<Arc<Orchestrator>>,
    Query(query): Query<TrendQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    if query.window == 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("window must be at least 1")),
        ));
    }
    let trend = orchestrator.health_trend(query.window);
    if trend.is_empty() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("no health sample recorded yet")),
        ));
    }
    Ok(Json(trend))
}
