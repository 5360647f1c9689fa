//! Lifecycle enums for worker handles and external requests.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process state of a worker handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Process spawned, not yet accepting requests.
    #[default]
    Starting,
    /// Idle and ready to accept a request.
    Ready,
    /// Exactly one request in flight.
    Busy,
    /// Shutdown in progress.
    Terminating,
    /// Process gone or unusable. Terminal.
    Dead,
}

impl WorkerState {
    /// Returns true if the handle can accept a new submission.
    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Returns true once the handle will never serve again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Terminating => "terminating",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of an external request as it moves through the orchestrator.
///
/// `Dispatched -> Succeeded`, or
/// `Dispatched -> FailedRecovering -> Retried -> Succeeded | FailedTerminal`, or
/// `Dispatched -> FailedRecovering -> FailedTerminal`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestPhase {
    #[default]
    Dispatched,
    Succeeded,
    FailedRecovering,
    Retried,
    FailedTerminal,
}

impl RequestPhase {
    /// Returns true if the request has reached a final answer.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedTerminal)
    }
}
