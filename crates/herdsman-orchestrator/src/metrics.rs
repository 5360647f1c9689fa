//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use herdsman_core::{RecoveryOutcome, Resource, WorkerState};

use crate::orchestrator::Orchestrator;

const OUTCOMES: [RecoveryOutcome; 5] = [
    RecoveryOutcome::Recovered,
    RecoveryOutcome::Failed,
    RecoveryOutcome::Escalated,
    RecoveryOutcome::MaxAttemptsExceeded,
    RecoveryOutcome::DeadlineExceeded,
];

/// Monotonic counters updated by the orchestrator.
#[derive(Debug, Default)]
pub struct Counters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    pool_timeouts: AtomicU64,
    retried: AtomicU64,
    recoveries: [AtomicU64; 5],
}

impl Counters {
    pub fn request_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pool_timeout(&self) {
        self.pool_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recovery(&self, outcome: RecoveryOutcome) {
        if let Some(i) = OUTCOMES.iter().position(|o| *o == outcome) {
            self.recoveries[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn recoveries(&self, outcome: RecoveryOutcome) -> u64 {
        OUTCOMES
            .iter()
            .position(|o| *o == outcome)
            .map_or(0, |i| self.recoveries[i].load(Ordering::Relaxed))
    }
}

/// Collect all metrics from the orchestrator and format as Prometheus text.
pub fn collect_metrics(orchestrator: &Orchestrator) -> String {
    let mut output = String::new();

    collect_worker_metrics(orchestrator, &mut output);
    collect_request_metrics(orchestrator, &mut output);
    collect_recovery_metrics(orchestrator, &mut output);
    collect_health_metrics(orchestrator, &mut output);

    output
}

/// Collect worker metrics by state.
fn collect_worker_metrics(orchestrator: &Orchestrator, output: &mut String) {
    let workers = orchestrator.workers();

    let mut not_started = 0u64;
    let mut starting = 0u64;
    let mut ready = 0u64;
    let mut busy = 0u64;
    let mut terminating = 0u64;
    let mut dead = 0u64;

    for worker in &workers {
        match worker.state {
            None => not_started += 1,
            Some(WorkerState::Starting) => starting += 1,
            Some(WorkerState::Ready) => ready += 1,
            Some(WorkerState::Busy) => busy += 1,
            Some(WorkerState::Terminating) => terminating += 1,
            Some(WorkerState::Dead) => dead += 1,
        }
    }

    writeln!(output, "# HELP herdsman_workers Worker slots by state").ok();
    writeln!(output, "# TYPE herdsman_workers gauge").ok();
    for (state, count) in [
        ("not_started", not_started),
        ("starting", starting),
        ("ready", ready),
        ("busy", busy),
        ("terminating", terminating),
        ("dead", dead),
    ] {
        writeln!(output, "herdsman_workers{{state=\"{state}\"}} {count}").ok();
    }

    let restarts: u64 = workers.iter().map(|w| w.restarts).sum();
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP herdsman_worker_restarts_total Workers replaced after dying or recovery"
    )
    .ok();
    writeln!(output, "# TYPE herdsman_worker_restarts_total counter").ok();
    writeln!(output, "herdsman_worker_restarts_total {restarts}").ok();
}

/// Collect request totals by result.
fn collect_request_metrics(orchestrator: &Orchestrator, output: &mut String) {
    let counters = orchestrator.counters();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP herdsman_requests_total Requests handled by final result"
    )
    .ok();
    writeln!(output, "# TYPE herdsman_requests_total counter").ok();
    writeln!(
        output,
        "herdsman_requests_total{{result=\"succeeded\"}} {}",
        counters.succeeded.load(Ordering::Relaxed)
    )
    .ok();
    writeln!(
        output,
        "herdsman_requests_total{{result=\"failed\"}} {}",
        counters.failed.load(Ordering::Relaxed)
    )
    .ok();
    writeln!(
        output,
        "herdsman_requests_total{{result=\"pool_timeout\"}} {}",
        counters.pool_timeouts.load(Ordering::Relaxed)
    )
    .ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP herdsman_requests_retried_total Requests resubmitted after recovery"
    )
    .ok();
    writeln!(output, "# TYPE herdsman_requests_retried_total counter").ok();
    writeln!(
        output,
        "herdsman_requests_retried_total {}",
        counters.retried.load(Ordering::Relaxed)
    )
    .ok();
}

/// Collect recovery outcome counters and ledger state.
fn collect_recovery_metrics(orchestrator: &Orchestrator, output: &mut String) {
    let counters = orchestrator.counters();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP herdsman_recoveries_total Recovery executions by outcome"
    )
    .ok();
    writeln!(output, "# TYPE herdsman_recoveries_total counter").ok();
    for outcome in OUTCOMES {
        writeln!(
            output,
            "herdsman_recoveries_total{{outcome=\"{}\"}} {}",
            outcome.as_str(),
            counters.recoveries(outcome)
        )
        .ok();
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP herdsman_ledger_attempts Consecutive failed recoveries per error kind"
    )
    .ok();
    writeln!(output, "# TYPE herdsman_ledger_attempts gauge").ok();
    for (kind, state) in orchestrator.ledger_state() {
        writeln!(
            output,
            "herdsman_ledger_attempts{{error_kind=\"{kind}\",max=\"{}\"}} {}",
            state.max, state.attempts
        )
        .ok();
    }
}

/// Collect the latest utilization reading.
fn collect_health_metrics(orchestrator: &Orchestrator, output: &mut String) {
    let Some(snapshot) = orchestrator.health_snapshot() else {
        return;
    };

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP herdsman_resource_utilization Latest sampled utilization (0 to 1)"
    )
    .ok();
    writeln!(output, "# TYPE herdsman_resource_utilization gauge").ok();
    for resource in Resource::ALL {
        writeln!(
            output,
            "herdsman_resource_utilization{{resource=\"{resource}\"}} {:.4}",
            snapshot.utilization(resource)
        )
        .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use herdsman_core::{ErrorKind, HealthSnapshot, ResourceUsage};
    use herdsman_ipc::testing::ScriptedLauncher;

    use crate::config::Config;

    #[test]
    fn test_counters_by_outcome() {
        let counters = Counters::default();
        counters.recovery(RecoveryOutcome::Recovered);
        counters.recovery(RecoveryOutcome::Recovered);
        counters.recovery(RecoveryOutcome::Escalated);
        assert_eq!(counters.recoveries(RecoveryOutcome::Recovered), 2);
        assert_eq!(counters.recoveries(RecoveryOutcome::Failed), 0);
    }

    #[tokio::test]
    async fn test_collect_metrics_fresh_orchestrator() {
        let orchestrator = Orchestrator::new(Config::default(), Arc::new(ScriptedLauncher::echo()));
        let output = collect_metrics(&orchestrator);

        assert!(output.contains("herdsman_workers{state=\"not_started\"} 4"));
        assert!(output.contains("herdsman_requests_total{result=\"succeeded\"} 0"));
        assert!(output.contains("herdsman_recoveries_total{outcome=\"recovered\"} 0"));
        assert!(output.contains(&format!(
            "herdsman_ledger_attempts{{error_kind=\"{}\",max=\"3\"}} 0",
            ErrorKind::AccessDenied
        )));
        // No snapshot yet.
        assert!(!output.contains("herdsman_resource_utilization"));
    }

    #[tokio::test]
    async fn test_collect_metrics_includes_latest_snapshot() {
        let orchestrator = Orchestrator::new(Config::default(), Arc::new(ScriptedLauncher::echo()));
        orchestrator
            .history()
            .push(HealthSnapshot::now(ResourceUsage::new(0.25, 0.5, 0.75)));

        let output = collect_metrics(&orchestrator);
        assert!(output.contains("herdsman_resource_utilization{resource=\"memory\"} 0.5000"));
    }
}
