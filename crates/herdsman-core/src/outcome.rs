//! Recovery reporting and the caller-facing command outcome.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::{CoreError, ErrorKind, RawError, RequestPhase};

/// One remediation step. Strategies are ordered lists of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStep {
    /// Bounded exponential delay before the next step.
    Backoff,
    /// Ask idle workers to release caches and temporary storage.
    Cleanup,
    /// Ask idle workers to reopen their engine connection.
    Reconnect,
    /// Ask idle workers to run an integrity self-check.
    VerifyIntegrity,
    /// Cancel in-flight submissions on busy handles.
    CancelOperations,
    /// Retire failed or dead handles and spawn replacements.
    RestartWorker,
    /// Raise an operator-visible alert.
    NotifyOperator,
}

impl RecoveryStep {
    pub const ALL: [RecoveryStep; 7] = [
        RecoveryStep::Backoff,
        RecoveryStep::Cleanup,
        RecoveryStep::Reconnect,
        RecoveryStep::VerifyIntegrity,
        RecoveryStep::CancelOperations,
        RecoveryStep::RestartWorker,
        RecoveryStep::NotifyOperator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backoff => "backoff",
            Self::Cleanup => "cleanup",
            Self::Reconnect => "reconnect",
            Self::VerifyIntegrity => "verify_integrity",
            Self::CancelOperations => "cancel_operations",
            Self::RestartWorker => "restart_worker",
            Self::NotifyOperator => "notify_operator",
        }
    }
}

impl fmt::Display for RecoveryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryStep {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecoveryStep::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| CoreError::UnknownRecoveryStep(s.to_string()))
    }
}

/// What happened when one step ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: RecoveryStep,

    /// False if the step itself raised.
    pub succeeded: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Probe result after the step; `None` when no probe ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_succeeded: Option<bool>,
}

/// Overall result of one recovery execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryOutcome {
    /// A probe succeeded after some step.
    Recovered,
    /// Every step ran and no probe succeeded.
    Failed,
    /// A step failure required escalation; remaining steps were skipped.
    Escalated,
    /// The ledger refused the attempt.
    MaxAttemptsExceeded,
    /// The deadline elapsed before the strategy finished.
    DeadlineExceeded,
}

impl RecoveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Recovered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recovered => "recovered",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
            Self::MaxAttemptsExceeded => "max_attempts_exceeded",
            Self::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

/// Ledger view for a single error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntryState {
    pub attempts: u32,
    pub max: u32,
}

impl LedgerEntryState {
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max
    }
}

/// Everything a caller needs to decide whether to retry at a higher level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySummary {
    pub error_kind: ErrorKind,
    pub requires_escalation: bool,
    pub outcome: RecoveryOutcome,
    pub steps: Vec<StepRecord>,

    /// Ledger state for `error_kind` after this execution.
    pub ledger: LedgerEntryState,

    pub original_error: RawError,

    /// True if the original request was resubmitted after recovery.
    pub retried: bool,

    /// Failure of the resubmitted request, when the retry itself failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_error: Option<RawError>,
}

impl RecoverySummary {
    /// Steps in the order they were attempted.
    pub fn attempted_steps(&self) -> Vec<RecoveryStep> {
        self.steps.iter().map(|record| record.step).collect()
    }
}

/// Structured result of the external `execute` command. Never a bare error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,

    #[serde(default, with = "base64_opt")]
    pub result: Option<Vec<u8>>,

    /// Taxonomy name, or `PoolAcquireTimeout` / `MaxAttemptsExceeded` for
    /// orchestration-level failures.
    #[serde(default)]
    pub error_kind: Option<String>,

    #[serde(default)]
    pub error_message: Option<String>,

    pub phase: RequestPhase,

    #[serde(default)]
    pub recovery_summary: Option<RecoverySummary>,
}

impl CommandOutcome {
    pub fn succeeded(result: Vec<u8>, phase: RequestPhase, summary: Option<RecoverySummary>) -> Self {
        Self {
            success: true,
            result: Some(result),
            error_kind: None,
            error_message: None,
            phase,
            recovery_summary: summary,
        }
    }

    pub fn failed(
        error_kind: impl Into<String>,
        error_message: impl Into<String>,
        summary: Option<RecoverySummary>,
    ) -> Self {
        Self {
            success: false,
            result: None,
            error_kind: Some(error_kind.into()),
            error_message: Some(error_message.into()),
            phase: RequestPhase::FailedTerminal,
            recovery_summary: summary,
        }
    }
}

/// Payloads travel as base64 strings in JSON.
mod base64_opt {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_names_match_serde() {
        for step in RecoveryStep::ALL {
            let json = serde_json::to_string(&step).unwrap();
            assert_eq!(json, format!("\"{}\"", step.as_str()));
            assert_eq!(step.as_str().parse::<RecoveryStep>().unwrap(), step);
        }
    }

    #[test]
    fn test_command_outcome_payload_is_base64() {
        let outcome = CommandOutcome::succeeded(b"hi".to_vec(), RequestPhase::Succeeded, None);
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["result"], "aGk=");

        let back: CommandOutcome = serde_json::from_value(value).unwrap();
        assert_eq!(back.result, Some(b"hi".to_vec()));
    }

    #[test]
    fn test_failed_outcome_is_terminal() {
        let outcome = CommandOutcome::failed("PoolAcquireTimeout", "no idle worker", None);
        assert!(!outcome.success);
        assert_eq!(outcome.phase, RequestPhase::FailedTerminal);
        assert!(outcome.result.is_none());
    }
}
