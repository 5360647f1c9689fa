//! Herdsman Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Process spawning or IPC
//! - Async runtimes
//! - Host metrics
//!
//! Everything the orchestrator, the worker IPC layer and the operator CLI
//! exchange is defined here.

pub mod error;
pub mod error_kind;
pub mod health;
pub mod ids;
pub mod outcome;
pub mod request;
pub mod status;

// Re-export commonly used types
pub use error::CoreError;
pub use error_kind::{Classification, ErrorKind};
pub use health::{HealthSnapshot, Resource, ResourceUsage};
pub use ids::{RequestId, WorkerId};
pub use outcome::{
    CommandOutcome, LedgerEntryState, RecoveryOutcome, RecoveryStep, RecoverySummary, StepRecord,
};
pub use request::{RawError, Request, Response};
pub use status::{RequestPhase, WorkerState};
