//! Recovery execution.
//!
//! [`RecoveryExecutor`] runs a strategy's steps in order against a
//! [`RecoveryActions`] implementation, probing health after each step and
//! keeping the per-kind ledger up to date. Steps never run past the
//! caller's deadline.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use herdsman_core::{
    Classification, ErrorKind, LedgerEntryState, RawError, RecoveryOutcome, RecoveryStep,
    RecoverySummary, StepRecord, WorkerId,
};
use rand::Rng;
use tracing::{error, info, warn};

use crate::classifier::ErrorClassifier;
use crate::ledger::RecoveryLedger;
use crate::strategy::RecoveryStrategy;

/// What a step knows about the failure it is recovering from.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub kind: ErrorKind,

    /// Worker whose request failed, when there was one.
    pub failed_worker: Option<WorkerId>,

    /// Ledger attempts before this execution.
    pub attempts: u32,

    pub deadline: Instant,
}

/// The side effects behind each recovery step.
#[async_trait]
pub trait RecoveryActions: Send + Sync {
    /// Perform one step. An error is classified; it aborts the strategy only
    /// when it requires escalation.
    async fn run_step(&self, step: RecoveryStep, ctx: &StepContext) -> Result<(), RawError>;

    /// Whether the system is healthy again.
    async fn probe(&self, deadline: Instant) -> bool;
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// `base * 2^attempts`, capped at `max`, plus up to a quarter of jitter
    /// (still capped).
    pub fn delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.min(16));
        let delay = self.base.saturating_mul(factor).min(self.max);
        let jitter_ms = (delay.as_millis() / 4) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (delay + jitter).min(self.max)
    }
}

/// Result of one recovery execution.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub strategy: String,
    pub classification: Classification,
    pub outcome: RecoveryOutcome,
    pub steps: Vec<StepRecord>,
    pub ledger: LedgerEntryState,
}

impl RecoveryReport {
    /// Summary handed back to callers alongside the original failure.
    pub fn into_summary(self, original_error: RawError) -> RecoverySummary {
        RecoverySummary {
            error_kind: self.classification.kind,
            requires_escalation: self.classification.requires_escalation,
            outcome: self.outcome,
            steps: self.steps,
            ledger: self.ledger,
            original_error,
            retried: false,
            retry_error: None,
        }
    }
}

/// Runs recovery strategies under the per-kind ledger.
#[derive(Debug)]
pub struct RecoveryExecutor {
    classifier: ErrorClassifier,
    probe_timeout: Duration,
    lock_timeout: Duration,
}

impl RecoveryExecutor {
    pub fn new(classifier: ErrorClassifier) -> Self {
        Self {
            classifier,
            probe_timeout: Duration::from_secs(1),
            lock_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Upper bound on waiting for a running recovery of the same kind.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Run `strategy` for a failure already classified as `classification`.
    ///
    /// Outcomes:
    /// - `MaxAttemptsExceeded` when the ledger is exhausted; nothing runs and
    ///   the ledger is unchanged.
    /// - `Recovered` as soon as a probe succeeds; the ledger is cleared.
    /// - `Escalated` when a step fails with an error requiring escalation.
    /// - `DeadlineExceeded` when the deadline passes mid-strategy.
    /// - `Failed` when every step ran without a successful probe.
    ///
    /// The last three add one failed attempt to the ledger, but only when at
    /// least one step ran.
    ///
    /// When `classification` itself requires escalation only the first step
    /// runs: a failed step or a failed probe escalates, and a passing probe
    /// ends the run as `Recovered`.
    pub async fn execute(
        &self,
        ledger: &RecoveryLedger,
        classification: Classification,
        strategy: &RecoveryStrategy,
        failed_worker: Option<WorkerId>,
        actions: &dyn RecoveryActions,
        deadline: Instant,
    ) -> RecoveryReport {
        let kind = classification.kind;
        let critical = classification.requires_escalation;
        let report = |outcome, steps, ledger| RecoveryReport {
            strategy: strategy.name.clone(),
            classification,
            outcome,
            steps,
            ledger,
        };

        let lock_deadline = deadline.min(Instant::now() + self.lock_timeout);
        let Some(guard) = ledger.acquire(kind, lock_deadline).await else {
            warn!(error_kind = %kind, "Deadline passed waiting for recovery of the same kind");
            return report(
                RecoveryOutcome::DeadlineExceeded,
                Vec::new(),
                ledger.entry_state(kind),
            );
        };

        if guard.is_exhausted() {
            let state = guard.state();
            warn!(
                error_kind = %kind,
                attempts = state.attempts,
                max = state.max,
                "Recovery refused, attempts exhausted"
            );
            return report(RecoveryOutcome::MaxAttemptsExceeded, Vec::new(), state);
        }

        let ctx = StepContext {
            kind,
            failed_worker,
            attempts: guard.state().attempts,
            deadline,
        };

        info!(
            error_kind = %kind,
            strategy = %strategy.name,
            steps = strategy.steps.len(),
            attempts = ctx.attempts,
            critical,
            "Starting recovery"
        );

        let mut records: Vec<StepRecord> = Vec::with_capacity(strategy.steps.len());
        let mut outcome = RecoveryOutcome::Failed;

        for &step in &strategy.steps {
            if Instant::now() >= deadline {
                outcome = RecoveryOutcome::DeadlineExceeded;
                break;
            }

            info!(step = %step, "Recovery step started");
            let result = match tokio::time::timeout_at(
                deadline.into(),
                actions.run_step(step, &ctx),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    warn!(step = %step, "Recovery step cut off by deadline");
                    records.push(StepRecord {
                        step,
                        succeeded: false,
                        error: Some(format!("recovery step {step} timed out")),
                        probe_succeeded: None,
                    });
                    outcome = RecoveryOutcome::DeadlineExceeded;
                    break;
                }
            };

            let mut record = StepRecord {
                step,
                succeeded: result.is_ok(),
                error: None,
                probe_succeeded: None,
            };

            if let Err(err) = result {
                let step_class = self.classifier.classify(&err);
                record.error = Some(err.message.clone());
                if step_class.requires_escalation || critical {
                    error!(
                        step = %step,
                        error = %err,
                        error_kind = %step_class.kind,
                        "Recovery step failed with critical error, escalating"
                    );
                    records.push(record);
                    outcome = RecoveryOutcome::Escalated;
                    break;
                }
                warn!(step = %step, error = %err, "Recovery step failed");
            } else {
                info!(step = %step, "Recovery step finished");
            }

            let healthy = self.probe(actions, deadline).await;
            record.probe_succeeded = Some(healthy);
            records.push(record);

            if healthy {
                info!(step = %step, "Health probe passed");
                outcome = RecoveryOutcome::Recovered;
                break;
            }
            if critical {
                error!(step = %step, error_kind = %kind, "Health probe failed after critical error, escalating");
                outcome = RecoveryOutcome::Escalated;
                break;
            }
        }

        if outcome == RecoveryOutcome::Failed && Instant::now() >= deadline {
            outcome = RecoveryOutcome::DeadlineExceeded;
        }

        let state = if outcome.is_success() {
            guard.record_success();
            guard.state()
        } else if records.is_empty() {
            warn!(error_kind = %kind, outcome = outcome.as_str(), "Recovery ran no steps, ledger unchanged");
            guard.state()
        } else {
            guard.record_failure()
        };

        info!(
            error_kind = %kind,
            outcome = outcome.as_str(),
            attempts = state.attempts,
            max = state.max,
            "Recovery finished"
        );

        report(outcome, records, state)
    }

    async fn probe(&self, actions: &dyn RecoveryActions, deadline: Instant) -> bool {
        let probe_deadline = deadline.min(Instant::now() + self.probe_timeout);
        tokio::time::timeout_at(probe_deadline.into(), actions.probe(probe_deadline))
            .await
            .unwrap_or(false)
    }
}
