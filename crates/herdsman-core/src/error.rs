//! Core domain errors.

use thiserror::Error;

/// Core domain errors for herdsman.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An error kind name did not match the fixed taxonomy.
    #[error("Unknown error kind: {0}")]
    UnknownErrorKind(String),

    /// A recovery step name did not match any known step.
    #[error("Unknown recovery step: {0}")]
    UnknownRecoveryStep(String),

    /// A resource name did not match cpu, memory or disk.
    #[error("Unknown resource: {0}")]
    UnknownResource(String),
}
