//! HTTP command and diagnostics interface.
//!
//! Provides endpoints for:
//! - Operation execution (`/v1/execute`)
//! - Health snapshot, history and trend (`/v1/health/*`)
//! - Recovery ledger inspection and reset (`/v1/ledger`)
//! - Worker list API (`/v1/workers`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::orchestrator::Orchestrator;

mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Command route
        .route("/v1/execute", post(handlers::execute))
        // Diagnostics routes
        .route("/v1/health/snapshot", get(handlers::health_snapshot))
        .route("/v1/health/history", get(handlers::health_history))
        .route("/v1/health/trend", get(handlers::health_trend))
        .route("/v1/ledger", get(handlers::get_ledger))
        .route("/v1/ledger/reset", post(handlers::reset_ledger))
        .route("/v1/workers", get(handlers::list_workers))
        // Observability routes
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(orchestrator)
}
