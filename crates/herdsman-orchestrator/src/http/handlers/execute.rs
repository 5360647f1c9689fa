//! Command handler.

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, warn};

use crate::http::responses::{ErrorResponse, ExecuteRequest};
use crate::orchestrator::Orchestrator;

/// Run an operation through the orchestrator.
///
/// Failures of the operation itself are reported inside the outcome with a
/// 200 status; only an unreadable request is rejected.
pub async fn execute(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(request): Json<ExecuteRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let payload = STANDARD.decode(request.payload.as_bytes()).map_err(|e| {
        warn!(operation = %request.operation, error = %e, "Rejected payload");
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(format!("payload is not valid base64: {e}"))),
        )
    })?;

    debug!(
        operation = %request.operation,
        payload_len = payload.len(),
        deadline_ms = ?request.deadline_ms,
        "Execute requested"
    );

    let outcome = orchestrator
        .command(
            &request.operation,
            payload,
            request.deadline_ms.map(Duration::from_millis),
        )
        .await;
    Ok(Json(outcome))
}
