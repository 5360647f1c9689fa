//! HTTP request and response types.

use serde::{Deserialize, Serialize};

// ============================================================================
// Command types
// ============================================================================

/// Request body for the execute endpoint.
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub operation: String,

    /// Operation payload (base64 encoded).
    #[serde(default)]
    pub payload: String,

    /// Deadline relative to receipt. Falls back to `[ipc].default_timeout_ms`.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

// ============================================================================
// Error types
// ============================================================================

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

// ============================================================================
// Health types
// ============================================================================

/// Query string for the history endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// Query string for the trend endpoint.
#[derive(Debug, Deserialize)]
pub struct TrendQuery {
    #[serde(default = "default_trend_window")]
    pub window: usize,
}

fn default_trend_window() -> usize {
    60
}

// ============================================================================
// Ledger types
// ============================================================================

/// Ledger row for a single error kind.
#[derive(Debug, Serialize)]
pub struct LedgerEntryResponse {
    pub error_kind: String,
    pub attempts: u32,
    pub max: u32,
    pub exhausted: bool,
}

/// Request body for the ledger reset endpoint. A null kind resets all.
#[derive(Debug, Default, Deserialize)]
pub struct ResetLedgerRequest {
    #[serde(default)]
    pub error_kind: Option<String>,
}
