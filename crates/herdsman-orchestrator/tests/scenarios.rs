//! End-to-end recovery scenarios against scripted in-memory workers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use herdsman_core::{
    ErrorKind, RawError, RecoveryOutcome, RecoveryStep, Request, RequestPhase, ResourceUsage,
};
use herdsman_ipc::testing::{Reply, ScriptedLauncher};
use herdsman_orchestrator::health::FixedProbe;
use herdsman_orchestrator::{Config, ErrorClassifier, ExecuteError, Orchestrator, StrategySelector};

fn config(size: usize) -> Config {
    let mut config = Config::default();
    config.pool.size = size;
    config.pool.startup_timeout_ms = 500;
    config.ipc.drain_grace_ms = 20;
    config.recovery.backoff_base_ms = 1;
    config.recovery.backoff_max_ms = 5;
    config.recovery.probe_timeout_ms = 200;
    config
}

#[tokio::test]
async fn memory_pressure_runs_cleanup_and_clears_ledger() {
    let launcher = ScriptedLauncher::echo();
    let mut config = config(2);
    config.health.interval_ms = 10;
    let orchestrator = Orchestrator::new(config, Arc::new(launcher.clone()));

    orchestrator
        .start(Box::new(FixedProbe::new(ResourceUsage::new(0.1, 0.95, 0.1))))
        .await;

    let waited = Instant::now();
    while orchestrator
        .counters()
        .recoveries(RecoveryOutcome::Recovered)
        == 0
    {
        assert!(waited.elapsed() < Duration::from_secs(5), "no recovery ran");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Cleanup alone satisfied the probe, so no worker was restarted.
    assert!(launcher.calls("__cleanup") >= 1);
    assert_eq!(launcher.launches(), 2);
    assert_eq!(
        orchestrator.ledger_state()[&ErrorKind::ResourceExhaustion].attempts,
        0
    );

    let snapshot = orchestrator.health_snapshot().unwrap();
    assert_eq!(snapshot.usage.memory, 0.95);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn corruption_escalates_after_first_step() {
    let launcher = ScriptedLauncher::new(|op, _| match op {
        "query" | "__verify" => Reply::fail("internal error: corruption detected"),
        _ => Reply::ok(Vec::new()),
    });
    let orchestrator = Orchestrator::new(config(1), Arc::new(launcher.clone()));

    let outcome = orchestrator
        .command("query", b"select 1".to_vec(), Some(Duration::from_secs(5)))
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.phase, RequestPhase::FailedTerminal);
    assert_eq!(outcome.error_kind.as_deref(), Some("MalformedOperation"));

    let summary = outcome.recovery_summary.unwrap();
    assert!(summary.requires_escalation);
    assert_eq!(summary.outcome, RecoveryOutcome::Escalated);
    assert_eq!(summary.attempted_steps(), vec![RecoveryStep::VerifyIntegrity]);
    assert!(!summary.retried);

    // restart_worker never ran and the request was not resubmitted.
    assert_eq!(launcher.launches(), 1);
    assert_eq!(launcher.calls("query"), 1);
    assert_eq!(
        orchestrator.ledger_state()[&ErrorKind::MalformedOperation].attempts,
        1
    );
}

#[tokio::test]
async fn corruption_is_terminal_even_when_verify_passes() {
    let launcher = ScriptedLauncher::new(|op, _| match op {
        "query" => Reply::fail("internal error: corruption detected"),
        _ => Reply::ok(Vec::new()),
    });
    let orchestrator = Orchestrator::new(config(1), Arc::new(launcher.clone()));

    let outcome = orchestrator
        .command("query", b"select 1".to_vec(), Some(Duration::from_secs(5)))
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.phase, RequestPhase::FailedTerminal);
    assert_eq!(outcome.error_kind.as_deref(), Some("MalformedOperation"));
    assert_eq!(
        outcome.error_message.as_deref(),
        Some("internal error: corruption detected")
    );

    // The first step ran and the system is healthy, but the corrupt request
    // is never resubmitted and no further steps run.
    let summary = outcome.recovery_summary.unwrap();
    assert!(summary.requires_escalation);
    assert_eq!(summary.attempted_steps(), vec![RecoveryStep::VerifyIntegrity]);
    assert!(!summary.retried);
    assert_eq!(launcher.calls("query"), 1);
    assert_eq!(launcher.calls("__verify"), 1);
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn repeated_worker_timeouts_keep_recovering() {
    let launcher = ScriptedLauncher::new(|op, payload| match op {
        "slow" => Reply::Hang,
        _ => Reply::ok(payload.to_vec()),
    });
    let mut config = config(1);
    config.recovery.min_recovery_budget_ms = 300;
    let orchestrator = Orchestrator::new(config, Arc::new(launcher.clone()));

    for run in 0..4 {
        let outcome = orchestrator
            .command("slow", Vec::new(), Some(Duration::from_millis(50)))
            .await;

        assert!(!outcome.success, "run {run}");
        assert_eq!(outcome.error_kind.as_deref(), Some("DeadlineExceeded"), "run {run}");

        // The request deadline was spent, yet recovery still ran its steps.
        let summary = outcome.recovery_summary.unwrap();
        assert_eq!(summary.outcome, RecoveryOutcome::Recovered, "run {run}");
        assert_eq!(
            summary.attempted_steps(),
            vec![RecoveryStep::CancelOperations],
            "run {run}"
        );
        assert!(summary.retried);
        assert_eq!(summary.ledger.attempts, 0, "run {run}");
    }

    assert_eq!(
        orchestrator.ledger_state()[&ErrorKind::DeadlineExceeded].attempts,
        0
    );
    assert_eq!(launcher.calls("slow"), 8);
}

#[tokio::test]
async fn exhausted_pool_times_out_instead_of_hanging() {
    let launcher = ScriptedLauncher::new(|op, payload| match op {
        "slow" => Reply::delayed(Duration::from_millis(800), Reply::ok(payload.to_vec())),
        _ => Reply::ok(payload.to_vec()),
    });
    let mut config = config(2);
    config.pool.acquire_timeout_ms = 100;
    let orchestrator = Orchestrator::new(config, Arc::new(launcher.clone()));

    let mut busy = Vec::new();
    for _ in 0..2 {
        let orchestrator = orchestrator.clone();
        busy.push(tokio::spawn(async move {
            orchestrator
                .command("slow", Vec::new(), Some(Duration::from_secs(5)))
                .await
        }));
    }

    let waited = Instant::now();
    while orchestrator
        .workers()
        .iter()
        .filter(|w| w.busy)
        .count()
        < 2
    {
        assert!(waited.elapsed() < Duration::from_secs(5), "workers never became busy");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let started = Instant::now();
    let err = orchestrator
        .execute(Request::new("echo", Vec::new(), Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecuteError::PoolAcquireTimeout { .. }));
    assert_eq!(err.kind_name(), "PoolAcquireTimeout");
    assert!(started.elapsed() < Duration::from_millis(700));

    for task in busy {
        assert!(task.await.unwrap().success);
    }
    // The timeout did not consume any recovery budget.
    assert!(orchestrator.ledger_state().values().all(|s| s.attempts == 0));
}

#[tokio::test]
async fn ledger_refuses_at_max_until_reset() {
    let healthy = Arc::new(AtomicBool::new(false));
    let pings = Arc::new(AtomicUsize::new(0));
    let (flag, counter) = (healthy.clone(), pings.clone());
    let launcher = ScriptedLauncher::new(move |op, _| match op {
        // The startup ping always passes.
        "__ping" if counter.fetch_add(1, Ordering::SeqCst) == 0 => Reply::ok(Vec::new()),
        "__ping" if flag.load(Ordering::SeqCst) => Reply::ok(Vec::new()),
        "__ping" => Reply::fail("not ready"),
        _ => Reply::fail("unknown column"),
    });
    let mut config = config(1);
    config.recovery.max_attempts = 3;
    config
        .recovery
        .strategies
        .insert(ErrorKind::Unclassified, vec![RecoveryStep::NotifyOperator]);
    let orchestrator = Orchestrator::new(config, Arc::new(launcher.clone()));

    for expected in 1..=2 {
        let outcome = orchestrator
            .command("query", Vec::new(), Some(Duration::from_secs(5)))
            .await;
        assert_eq!(outcome.error_kind.as_deref(), Some("Unclassified"));
        assert_eq!(
            orchestrator.ledger_state()[&ErrorKind::Unclassified].attempts,
            expected
        );
    }

    // At max - 1, one more failure exhausts the kind.
    let outcome = orchestrator
        .command("query", Vec::new(), Some(Duration::from_secs(5)))
        .await;
    assert_eq!(
        outcome.recovery_summary.unwrap().outcome,
        RecoveryOutcome::Failed
    );
    let state = orchestrator.ledger_state()[&ErrorKind::Unclassified];
    assert_eq!(state.attempts, 3);
    assert!(state.is_exhausted());

    // Refused even though a probe would now pass.
    healthy.store(true, Ordering::SeqCst);
    let notify_runs = launcher.calls("__ping");
    let refused = orchestrator
        .command("query", Vec::new(), Some(Duration::from_secs(5)))
        .await;
    assert_eq!(refused.error_kind.as_deref(), Some("MaxAttemptsExceeded"));
    let summary = refused.recovery_summary.unwrap();
    assert_eq!(summary.outcome, RecoveryOutcome::MaxAttemptsExceeded);
    assert!(summary.steps.is_empty());
    assert_eq!(launcher.calls("__ping"), notify_runs);
    assert_eq!(orchestrator.ledger_state()[&ErrorKind::Unclassified].attempts, 3);

    orchestrator.reset_ledger(None);
    assert_eq!(orchestrator.ledger_state()[&ErrorKind::Unclassified].attempts, 0);
}

#[tokio::test]
async fn successful_recovery_zeroes_a_partially_used_ledger() {
    let healthy = Arc::new(AtomicBool::new(false));
    let failed_while_healthy = Arc::new(AtomicBool::new(false));
    let pings = Arc::new(AtomicUsize::new(0));
    let (flag, failed, counter) = (healthy.clone(), failed_while_healthy.clone(), pings.clone());
    let launcher = ScriptedLauncher::new(move |op, _| match op {
        "__ping" if counter.fetch_add(1, Ordering::SeqCst) == 0 => Reply::ok(Vec::new()),
        "__ping" if flag.load(Ordering::SeqCst) => Reply::ok(Vec::new()),
        "__ping" => Reply::fail("not ready"),
        // Once healthy, the first query still fails and the retry succeeds.
        "query" if flag.load(Ordering::SeqCst) && failed.swap(true, Ordering::SeqCst) => {
            Reply::ok(b"rows".to_vec())
        }
        _ => Reply::fail("unknown column"),
    });
    let mut config = config(1);
    config
        .recovery
        .strategies
        .insert(ErrorKind::Unclassified, vec![RecoveryStep::NotifyOperator]);
    let orchestrator = Orchestrator::new(config, Arc::new(launcher.clone()));

    for _ in 0..2 {
        orchestrator
            .command("query", Vec::new(), Some(Duration::from_secs(5)))
            .await;
    }
    assert_eq!(orchestrator.ledger_state()[&ErrorKind::Unclassified].attempts, 2);

    healthy.store(true, Ordering::SeqCst);
    let outcome = orchestrator
        .command("query", Vec::new(), Some(Duration::from_secs(5)))
        .await;
    assert!(outcome.success);
    assert_eq!(outcome.result.as_deref(), Some(&b"rows"[..]));
    assert!(outcome.recovery_summary.unwrap().retried);
    assert_eq!(orchestrator.ledger_state()[&ErrorKind::Unclassified].attempts, 0);
}

#[test]
fn classification_is_deterministic_and_every_kind_has_a_strategy() {
    let classifier = ErrorClassifier::default();
    let messages = [
        "out of memory",
        "connection reset by peer",
        "operation timed out",
        "permission denied",
        "syntax error near SELECT",
        "internal error: corruption detected",
        "something odd",
        "",
    ];
    for message in messages {
        let raw = RawError::new(message);
        let first = classifier.classify(&raw);
        for _ in 0..10 {
            assert_eq!(classifier.classify(&raw), first);
        }
    }

    let selector = StrategySelector::default();
    for kind in ErrorKind::ALL {
        let strategy = selector.select(kind);
        assert!(!strategy.steps.is_empty(), "{kind} has no steps");
    }
}
