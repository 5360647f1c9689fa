//! Keyword-based error classification.
//!
//! Maps a [`RawError`] to an [`ErrorKind`] by case-insensitive substring
//! match against an ordered table. The first group with a matching keyword
//! wins; a message matching nothing is `Unclassified`. Escalation is decided
//! independently from the kind, so any kind can require it.

use herdsman_core::{Classification, ErrorKind, RawError};

/// Version of the built-in keyword table. Bump when the table changes so
/// logged classifications stay comparable.
pub const CLASSIFIER_TABLE_VERSION: u32 = 1;

/// Keywords mapping to a single kind.
#[derive(Debug, Clone, Copy)]
pub struct KeywordGroup {
    pub kind: ErrorKind,
    pub keywords: &'static [&'static str],
}

/// Built-in keyword table, matched top to bottom.
pub const KEYWORD_GROUPS: &[KeywordGroup] = &[
    KeywordGroup {
        kind: ErrorKind::ResourceExhaustion,
        keywords: &["memory", "out of space", "no space", "disk full", "resource"],
    },
    KeywordGroup {
        kind: ErrorKind::ConnectivityFailure,
        keywords: &["connection", "database", "closed", "broken pipe", "unreachable"],
    },
    KeywordGroup {
        kind: ErrorKind::DeadlineExceeded,
        keywords: &["timeout", "timed out", "cancelled", "deadline"],
    },
    KeywordGroup {
        kind: ErrorKind::AccessDenied,
        keywords: &["permission", "access", "denied", "unauthorized"],
    },
    KeywordGroup {
        kind: ErrorKind::MalformedOperation,
        keywords: &["syntax", "invalid operation", "malformed", "parse", "corrupt"],
    },
];

/// Any of these forces `requires_escalation`, whatever the kind.
pub const CRITICAL_KEYWORDS: &[&str] = &["corruption", "fatal", "internal error", "panic"];

/// Pure, deterministic classifier over a static keyword table.
#[derive(Debug, Clone, Copy)]
pub struct ErrorClassifier {
    version: u32,
    groups: &'static [KeywordGroup],
    critical: &'static [&'static str],
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            version: CLASSIFIER_TABLE_VERSION,
            groups: KEYWORD_GROUPS,
            critical: CRITICAL_KEYWORDS,
        }
    }
}

impl ErrorClassifier {
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn groups(&self) -> &'static [KeywordGroup] {
        self.groups
    }

    pub fn classify(&self, error: &RawError) -> Classification {
        self.classify_message(&error.message)
    }

    pub fn classify_message(&self, message: &str) -> Classification {
        let message = message.to_lowercase();

        let kind = self
            .groups
            .iter()
            .find(|group| group.keywords.iter().any(|k| message.contains(k)))
            .map(|group| group.kind)
            .unwrap_or(ErrorKind::Unclassified);

        let requires_escalation = self.critical.iter().any(|k| message.contains(k));

        Classification {
            kind,
            requires_escalation,
        }
    }
}
