//! Recovery ledger handlers.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use herdsman_core::ErrorKind;

use crate::http::responses::{ErrorResponse, LedgerEntryResponse, ResetLedgerRequest};
use crate::orchestrator::Orchestrator;

fn ledger_rows(orchestrator: &Orchestrator) -> Vec<LedgerEntryResponse> {
    orchestrator
        .ledger_state()
        .into_iter()
        .map(|(kind, state)| LedgerEntryResponse {
            error_kind: kind.to_string(),
            attempts: state.attempts,
            max: state.max,
            exhausted: state.is_exhausted(),
        })
        .collect()
}

/// Attempt counters for every error kind.
pub async fn get_ledger(
    State(orchestrator): State<Arc<Orchestrator>>,
) -> Json<Vec<LedgerEntryResponse>> {
    Json(ledger_rows(&orchestrator))
}

/// Operator reset. Returns the ledger after the reset.
pub async fn reset_ledger(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(request): Json<ResetLedgerRequest>,
) -> Result<Json<Vec<LedgerEntryResponse>>, (StatusCode, Json<ErrorResponse>)> {
    let kind = match request.error_kind.as_deref() {
        None => None,
        Some(name) => Some(name.parse::<ErrorKind>().map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(e.to_string())),
            )
        })?),
    };

    orchestrator.reset_ledger(kind);
    Ok(Json(ledger_rows(&orchestrator)))
}
