//! Error types for the CLI client.

use thiserror::Error;

/// Errors that can occur when talking to the orchestrator.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure or unreadable response.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The orchestrator answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Bad command line input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
