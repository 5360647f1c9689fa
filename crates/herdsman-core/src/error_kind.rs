//! The fixed failure taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CoreError;

/// Classified category of a raw failure.
///
/// Variants are declared from most to least severe and the derived ordering
/// follows that. The ordering is for display only; recovery never looks at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    ResourceExhaustion,
    ConnectivityFailure,
    DeadlineExceeded,
    AccessDenied,
    MalformedOperation,
    Unclassified,
}

impl ErrorKind {
    /// Every kind, in severity order.
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::ResourceExhaustion,
        ErrorKind::ConnectivityFailure,
        ErrorKind::DeadlineExceeded,
        ErrorKind::AccessDenied,
        ErrorKind::MalformedOperation,
        ErrorKind::Unclassified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResourceExhaustion => "ResourceExhaustion",
            Self::ConnectivityFailure => "ConnectivityFailure",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::AccessDenied => "AccessDenied",
            Self::MalformedOperation => "MalformedOperation",
            Self::Unclassified => "Unclassified",
        }
    }

    /// Label used for metrics and config keys.
    pub fn snake_name(&self) -> &'static str {
        match self {
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::ConnectivityFailure => "connectivity_failure",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::AccessDenied => "access_denied",
            Self::MalformedOperation => "malformed_operation",
            Self::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = CoreError;

    /// Accepts both `ResourceExhaustion` and `resource_exhaustion`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s || kind.snake_name() == s)
            .ok_or_else(|| CoreError::UnknownErrorKind(s.to_string()))
    }
}

/// Output of the error classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ErrorKind,

    /// Set when the message carries a critical keyword. Independent of `kind`.
    pub requires_escalation: bool,
}

impl Classification {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            requires_escalation: false,
        }
    }

    pub fn escalated(kind: ErrorKind) -> Self {
        Self {
            kind,
            requires_escalation: true,
        }
    }
}
