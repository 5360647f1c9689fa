//! Error types for worker IPC.

use std::time::Duration;

use herdsman_core::{RawError, WorkerState};
use thiserror::Error;

/// Errors that can occur while talking to a worker process.
///
/// Display strings are what the error classifier sees once the failure is
/// converted with [`IpcError::to_raw_error`], so keep their keywords stable.
#[derive(Debug, Error)]
pub enum IpcError {
    /// The OS could not create the worker process.
    #[error("Failed to spawn worker process: {0}")]
    Spawn(#[from] std::io::Error),

    /// The worker started but did not answer its startup probe.
    #[error("Worker startup probe failed: {0}")]
    Startup(String),

    /// The worker's input or output stream is unusable.
    #[error("Worker connection closed: {reason}")]
    Transport {
        reason: String,
        exit_code: Option<i32>,
    },

    /// No complete response arrived before the deadline.
    #[error("Timeout waiting for worker response after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    /// Bytes arrived that do not form a well-formed response.
    #[error("Malformed response frame: {0}")]
    Decode(String),

    /// The encoded request does not fit in one frame. Nothing was written.
    #[error("Invalid operation: request of {len} bytes exceeds the {max} byte frame limit")]
    FrameTooLarge { len: usize, max: usize },

    /// Submission attempted on a handle that is not `Ready`.
    #[error("Worker not ready to accept requests (state: {0})")]
    NotReady(WorkerState),

    /// The in-flight submission was cancelled by the orchestrator.
    #[error("Operation cancelled by orchestrator")]
    Cancelled,
}

impl IpcError {
    pub(crate) fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
            exit_code: None,
        }
    }

    /// Whether the handle must be considered dead after this error.
    ///
    /// A request rejected before anything reached the stream leaves the
    /// worker untouched.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::FrameTooLarge { .. } | Self::NotReady(_))
    }

    /// Convert into the raw failure handed to the classifier.
    pub fn to_raw_error(&self) -> RawError {
        let raw = RawError::new(self.to_string());
        match self {
            Self::Transport {
                exit_code: Some(code),
                ..
            } => raw.with_exit_code(*code),
            _ => raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_error_keeps_exit_code() {
        let err = IpcError::Transport {
            reason: "worker exited".to_string(),
            exit_code: Some(3),
        };
        let raw = err.to_raw_error();
        assert_eq!(raw.exit_code, Some(3));
        assert!(raw.message.contains("connection closed"));
    }

    #[test]
    fn test_rejections_are_not_fatal() {
        assert!(!IpcError::FrameTooLarge { len: 10, max: 5 }.is_fatal());
        assert!(!IpcError::NotReady(WorkerState::Busy).is_fatal());
        assert!(IpcError::Cancelled.is_fatal());
        assert!(IpcError::Timeout {
            after: Duration::from_millis(5)
        }
        .is_fatal());
    }
}
