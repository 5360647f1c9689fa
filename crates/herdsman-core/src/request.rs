//! Request and Response types exchanged with worker processes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// A request for one worker operation.
///
/// Immutable once issued; retries resubmit the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Operation name understood by the worker.
    pub operation: String,

    /// Opaque payload.
    pub payload: Vec<u8>,

    /// Absolute deadline for a complete response.
    pub deadline: Instant,
}

impl Request {
    /// Create a new Request that must complete within `timeout` from now.
    pub fn new(operation: impl Into<String>, payload: impl Into<Vec<u8>>, timeout: Duration) -> Self {
        Self {
            operation: operation.into(),
            payload: payload.into(),
            deadline: Instant::now() + timeout,
        }
    }

    /// Create a new Request with an explicit deadline.
    pub fn with_deadline(
        operation: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        deadline: Instant,
    ) -> Self {
        Self {
            operation: operation.into(),
            payload: payload.into(),
            deadline,
        }
    }

    /// Time left before the deadline, zero if it already passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Returns true if the deadline has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// A raw, unclassified failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawError {
    /// Human readable message. The classifier reads only this.
    pub message: String,

    /// Exit code of the originating process, when the failure came from a
    /// process exit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl RawError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }
}

impl fmt::Display for RawError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{} (exit code {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

/// Exactly one Response is produced per Request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub success: bool,

    /// Result payload on success.
    pub result: Option<Vec<u8>>,

    /// Failure detail when `success` is false.
    pub error: Option<RawError>,
}

impl Response {
    pub fn ok(result: impl Into<Vec<u8>>) -> Self {
        Self {
            success: true,
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn failed(error: RawError) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
        }
    }

    /// Consume into a `Result`, synthesizing an error if a failed response
    /// carried none.
    pub fn into_result(self) -> Result<Vec<u8>, RawError> {
        if self.success {
            Ok(self.result.unwrap_or_default())
        } else {
            Err(self
                .error
                .unwrap_or_else(|| RawError::new("worker reported failure without detail")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_remaining_never_negative() {
        let request = Request::with_deadline("q", Vec::new(), Instant::now());
        assert_eq!(request.remaining(), Duration::ZERO);
        assert!(request.is_expired());
    }

    #[test]
    fn test_failed_response_without_detail() {
        let response = Response {
            success: false,
            result: None,
            error: None,
        };
        let err = response.into_result().unwrap_err();
        assert!(err.message.contains("without detail"));
    }

    #[test]
    fn test_raw_error_display() {
        let err = RawError::new("worker crashed").with_exit_code(137);
        assert_eq!(err.to_string(), "worker crashed (exit code 137)");
    }
}
