//! Top-level request and recovery coordination.
//!
//! A request is dispatched to an idle worker. On failure the raw error is
//! classified, the matching strategy runs under the ledger, and a recovered
//! request is resubmitted exactly once. Critical health readings drive the
//! same recovery path without a request.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use herdsman_core::{
    Classification, CommandOutcome, ErrorKind, HealthSnapshot, LedgerEntryState, RawError,
    RecoveryOutcome, RecoverySummary, Request, RequestId, RequestPhase, Response, WorkerId,
};
use herdsman_ipc::protocol::is_reserved;
use herdsman_ipc::WorkerLauncher;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actions::PoolActions;
use crate::classifier::ErrorClassifier;
use crate::config::{Config, ConfigError};
use crate::health::{
    HealthEvent, HealthHistory, HealthSampler, ResourceProbe, ResourceThresholds, ResourceTrend,
};
use crate::ledger::RecoveryLedger;
use crate::metrics::Counters;
use crate::pool::{PoolError, WorkerPool, WorkerSummary};
use crate::recovery::{BackoffPolicy, RecoveryExecutor, RecoveryReport};
use crate::strategy::StrategySelector;

/// Why a request could not be answered.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// No worker became idle in time. No recovery was attempted.
    #[error("No idle worker became available within {}ms", .waited.as_millis())]
    PoolAcquireTimeout { waited: Duration },

    /// Reserved operation names are for the orchestrator only.
    #[error("Invalid operation: '{0}' is reserved")]
    ReservedOperation(String),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    /// The request failed and recovery or the retry did not save it.
    #[error(
        "{} failure ended terminally ({}): {}",
        .summary.error_kind,
        .summary.outcome.as_str(),
        .summary.original_error
    )]
    Terminal { summary: Box<RecoverySummary> },
}

impl ExecuteError {
    /// Name reported as `error_kind` to external callers.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::PoolAcquireTimeout { .. } => "PoolAcquireTimeout",
            Self::ReservedOperation(_) => ErrorKind::MalformedOperation.as_str(),
            Self::ShuttingDown => "ShuttingDown",
            Self::Terminal { summary } => match summary.outcome {
                RecoveryOutcome::MaxAttemptsExceeded => "MaxAttemptsExceeded",
                _ => summary.error_kind.as_str(),
            },
        }
    }

    pub fn summary(&self) -> Option<&RecoverySummary> {
        match self {
            Self::Terminal { summary } => Some(summary),
            _ => None,
        }
    }

    pub fn into_summary(self) -> Option<RecoverySummary> {
        match self {
            Self::Terminal { summary } => Some(*summary),
            _ => None,
        }
    }
}

/// A successfully answered request.
#[derive(Debug, Clone)]
pub struct Execution {
    pub response: Response,
    pub phase: RequestPhase,

    /// Present when the request only succeeded after recovery.
    pub recovery: Option<RecoverySummary>,
}

enum DispatchFailure {
    Pool(PoolError),
    Worker {
        error: RawError,
        worker: Option<WorkerId>,
    },
}

/// Coordinates the pool, the health sampler and recovery.
pub struct Orchestrator {
    config: Config,
    pool: WorkerPool,
    classifier: ErrorClassifier,
    selector: StrategySelector,
    ledger: RecoveryLedger,
    executor: RecoveryExecutor,
    actions: PoolActions,
    history: Arc<HealthHistory>,
    counters: Counters,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build an orchestrator whose workers come from `launcher`.
    pub fn new(config: Config, launcher: Arc<dyn WorkerLauncher>) -> Arc<Self> {
        let recovery = &config.recovery;
        let pool = WorkerPool::new(config.pool.size, launcher, config.handle_options());

        let ledger = recovery
            .max_attempts_overrides
            .iter()
            .fold(RecoveryLedger::new(recovery.max_attempts), |ledger, (&kind, &max)| {
                ledger.with_max(kind, max)
            });

        let classifier = ErrorClassifier::default();
        let executor = RecoveryExecutor::new(classifier)
            .with_probe_timeout(Duration::from_millis(recovery.probe_timeout_ms))
            .with_lock_timeout(Duration::from_millis(recovery.ledger_lock_timeout_ms));

        let actions = PoolActions::new(pool.clone())
            .with_backoff(BackoffPolicy {
                base: Duration::from_millis(recovery.backoff_base_ms),
                max: Duration::from_millis(recovery.backoff_max_ms),
            })
            .with_op_timeout(Duration::from_millis(recovery.probe_timeout_ms));

        Arc::new(Self {
            selector: StrategySelector::with_overrides(&recovery.strategies),
            history: Arc::new(HealthHistory::new(config.health.history_capacity)),
            pool,
            classifier,
            ledger,
            executor,
            actions,
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Validate `config` and launch workers from its `[pool]` settings.
    pub fn from_config(config: Config) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let launcher = Arc::new(config.launcher());
        Ok(Self::new(config, launcher))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn history(&self) -> &Arc<HealthHistory> {
        &self.history
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Start the workers and, when enabled, health sampling from `probe`.
    pub async fn start(self: &Arc<Self>, probe: Box<dyn ResourceProbe>) {
        self.pool.warm_up().await;
        if self.config.health.enabled {
            self.spawn_health_tasks(probe);
        } else {
            info!("Health sampling disabled");
        }
    }

    fn spawn_health_tasks(self: &Arc<Self>, probe: Box<dyn ResourceProbe>) {
        let (tx, mut rx) = mpsc::channel::<HealthEvent>(16);

        let sampler = HealthSampler::new(probe, self.history.clone())
            .with_thresholds(ResourceThresholds::from_config(&self.config.health))
            .with_interval(Duration::from_millis(self.config.health.interval_ms));
        let sampler_task = tokio::spawn(sampler.run(tx, self.shutdown.clone()));

        // Ends once the sampler stops and drops its sender.
        let this = Arc::clone(self);
        let consumer_task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                this.handle_health_event(&event).await;
            }
            debug!("Health event consumer stopped");
        });

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([sampler_task, consumer_task]);
    }

    /// Answer one request, recovering and retrying once on failure.
    pub async fn execute(&self, request: Request) -> Result<Execution, ExecuteError> {
        let request_id = RequestId::generate();

        if is_reserved(&request.operation) {
            warn!(request_id = %request_id, operation = %request.operation, "Reserved operation rejected");
            self.counters.request_failed();
            return Err(ExecuteError::ReservedOperation(request.operation));
        }

        debug!(
            request_id = %request_id,
            operation = %request.operation,
            phase = ?RequestPhase::Dispatched,
            "Dispatching request"
        );

        let (raw, failed_worker) = match self.dispatch(&request).await {
            Ok(response) => {
                self.counters.request_succeeded();
                return Ok(Execution {
                    response,
                    phase: RequestPhase::Succeeded,
                    recovery: None,
                });
            }
            Err(DispatchFailure::Pool(PoolError::AcquireTimeout { waited })) => {
                self.counters.pool_timeout();
                warn!(request_id = %request_id, waited_ms = waited.as_millis() as u64, "Pool acquire timed out");
                return Err(ExecuteError::PoolAcquireTimeout { waited });
            }
            Err(DispatchFailure::Pool(_)) => return Err(ExecuteError::ShuttingDown),
            Err(DispatchFailure::Worker { error, worker }) => (error, worker),
        };

        let classification = self.classifier.classify(&raw);
        warn!(
            request_id = %request_id,
            error_kind = %classification.kind,
            requires_escalation = classification.requires_escalation,
            worker_id = ?failed_worker,
            error = %raw,
            phase = ?RequestPhase::FailedRecovering,
            "Request failed, starting recovery"
        );

        let budget = self.recovery_budget(request.deadline);
        let report = self.recover(classification, failed_worker, budget).await;

        let mut summary = report.into_summary(raw);
        if summary.requires_escalation {
            self.counters.request_failed();
            error!(
                request_id = %request_id,
                error_kind = %summary.error_kind,
                outcome = summary.outcome.as_str(),
                phase = ?RequestPhase::FailedTerminal,
                "Critical failure, request not retried"
            );
            return Err(ExecuteError::Terminal {
                summary: Box::new(summary),
            });
        }
        if !summary.outcome.is_success() {
            self.counters.request_failed();
            error!(
                request_id = %request_id,
                error_kind = %summary.error_kind,
                outcome = summary.outcome.as_str(),
                phase = ?RequestPhase::FailedTerminal,
                "Request failed terminally"
            );
            return Err(ExecuteError::Terminal {
                summary: Box::new(summary),
            });
        }

        summary.retried = true;
        self.counters.request_retried();
        info!(request_id = %request_id, phase = ?RequestPhase::Retried, "Recovered, retrying request");

        let retry = Request {
            deadline: budget,
            ..request
        };
        match self.dispatch(&retry).await {
            Ok(response) => {
                self.counters.request_succeeded();
                info!(request_id = %request_id, "Request succeeded after recovery");
                Ok(Execution {
                    response,
                    phase: RequestPhase::Succeeded,
                    recovery: Some(summary),
                })
            }
            Err(failure) => {
                let retry_error = match failure {
                    DispatchFailure::Pool(e) => RawError::new(e.to_string()),
                    DispatchFailure::Worker { error, .. } => error,
                };
                self.counters.request_failed();
                error!(
                    request_id = %request_id,
                    error = %retry_error,
                    phase = ?RequestPhase::FailedTerminal,
                    "Retry after recovery failed"
                );
                summary.retry_error = Some(retry_error);
                Err(ExecuteError::Terminal {
                    summary: Box::new(summary),
                })
            }
        }
    }

    /// The external `execute` command. Never returns a bare error.
    pub async fn command(
        &self,
        operation: &str,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> CommandOutcome {
        let timeout = timeout.unwrap_or_else(|| self.config.default_timeout());
        match self.execute(Request::new(operation, payload, timeout)).await {
            Ok(execution) => CommandOutcome::succeeded(
                execution.response.result.unwrap_or_default(),
                execution.phase,
                execution.recovery,
            ),
            Err(e) => {
                let kind = e.kind_name();
                let message = match e.summary() {
                    Some(summary) => summary
                        .retry_error
                        .as_ref()
                        .unwrap_or(&summary.original_error)
                        .message
                        .clone(),
                    None => e.to_string(),
                };
                CommandOutcome::failed(kind, message, e.into_summary())
            }
        }
    }

    /// React to a health event. Critical readings start resource recovery
    /// directly, without going through the classifier.
    pub async fn handle_health_event(&self, event: &HealthEvent) -> Option<RecoveryReport> {
        if !event.is_critical() {
            return None;
        }

        warn!(
            resource = %event.resource,
            utilization = event.utilization,
            "Critical resource level, starting recovery"
        );
        let budget = Duration::from_millis(self.config.recovery.health_recovery_budget_ms);
        let report = self
            .recover(
                Classification::new(ErrorKind::ResourceExhaustion),
                None,
                Instant::now() + budget,
            )
            .await;
        Some(report)
    }

    /// Deadline for recovery and the retry: the request deadline plus the
    /// configured extension, but never less than the minimum budget from now.
    fn recovery_budget(&self, request_deadline: Instant) -> Instant {
        let recovery = &self.config.recovery;
        let extended = request_deadline + Duration::from_millis(recovery.retry_deadline_extension_ms);
        let floor = Instant::now() + Duration::from_millis(recovery.min_recovery_budget_ms);
        extended.max(floor)
    }

    async fn recover(
        &self,
        classification: Classification,
        failed_worker: Option<WorkerId>,
        deadline: Instant,
    ) -> RecoveryReport {
        let strategy = self.selector.select(classification.kind);
        let report = self
            .executor
            .execute(
                &self.ledger,
                classification,
                &strategy,
                failed_worker,
                &self.actions,
                deadline,
            )
            .await;
        self.counters.recovery(report.outcome);
        report
    }

    /// Lease a worker and submit. The lease is released before returning so
    /// recovery can act on the worker.
    async fn dispatch(&self, request: &Request) -> Result<Response, DispatchFailure> {
        let acquire_deadline = request
            .deadline
            .min(Instant::now() + self.config.acquire_timeout());

        let mut lease = match self.pool.acquire(acquire_deadline).await {
            Ok(lease) => lease,
            Err(PoolError::Launch(e)) => {
                return Err(DispatchFailure::Worker {
                    error: e.to_raw_error(),
                    worker: None,
                })
            }
            Err(e) => return Err(DispatchFailure::Pool(e)),
        };
        let worker = lease.worker_id().cloned();

        match lease.submit(request).await {
            Ok(response) if response.success => Ok(response),
            Ok(response) => Err(DispatchFailure::Worker {
                error: response
                    .error
                    .unwrap_or_else(|| RawError::new("worker reported failure without details")),
                worker,
            }),
            Err(e) => Err(DispatchFailure::Worker {
                error: e.to_raw_error(),
                worker,
            }),
        }
    }

    pub fn health_snapshot(&self) -> Option<HealthSnapshot> {
        self.history.latest()
    }

    pub fn health_history(&self, limit: Option<usize>) -> Vec<HealthSnapshot> {
        self.history.snapshot(limit)
    }

    /// Average and peak per resource over the last `window` samples.
    pub fn health_trend(&self, window: usize) -> Vec<ResourceTrend> {
        self.history.trend(window)
    }

    pub fn ledger_state(&self) -> BTreeMap<ErrorKind, LedgerEntryState> {
        self.ledger.state()
    }

    /// Operator reset of one kind, or of every kind when `kind` is `None`.
    pub fn reset_ledger(&self, kind: Option<ErrorKind>) {
        self.ledger.reset(kind);
    }

    pub fn workers(&self) -> Vec<WorkerSummary> {
        self.pool.workers()
    }

    /// Stop health sampling and terminate every worker.
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.shutdown.cancel();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.pool.shutdown().await;
        info!("Orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herdsman_core::{RecoveryStep, ResourceUsage};
    use herdsman_ipc::testing::{Reply, ScriptedLauncher};

    use crate::health::{FixedProbe, Severity};

    fn config(size: usize) -> Config {
        let mut config = Config::default();
        config.pool.size = size;
        config.pool.startup_timeout_ms = 500;
        config.ipc.drain_grace_ms = 20;
        config.recovery.backoff_base_ms = 1;
        config.recovery.backoff_max_ms = 5;
        config
    }

    fn orchestrator(size: usize, launcher: &ScriptedLauncher) -> Arc<Orchestrator> {
        Orchestrator::new(config(size), Arc::new(launcher.clone()))
    }

    #[tokio::test]
    async fn test_success_needs_no_recovery() {
        let launcher = ScriptedLauncher::echo();
        let orch = orchestrator(2, &launcher);

        let outcome = orch.command("echo", b"data".to_vec(), None).await;
        assert!(outcome.success);
        assert_eq!(outcome.result.as_deref(), Some(&b"data"[..]));
        assert_eq!(outcome.phase, RequestPhase::Succeeded);
        assert!(outcome.recovery_summary.is_none());
    }

    #[tokio::test]
    async fn test_worker_failure_recovers_and_retries_once() {
        let failures = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = failures.clone();
        let launcher = ScriptedLauncher::new(move |op, payload| match op {
            "query" if seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 => {
                Reply::fail("database connection lost")
            }
            "query" => Reply::ok(payload.to_vec()),
            _ => Reply::ok(Vec::new()),
        });
        let orch = orchestrator(1, &launcher);

        let execution = orch
            .execute(Request::new("query", b"q".to_vec(), Duration::from_secs(5)))
            .await
            .unwrap();

        let summary = execution.recovery.unwrap();
        assert_eq!(summary.error_kind, ErrorKind::ConnectivityFailure);
        assert_eq!(summary.outcome, RecoveryOutcome::Recovered);
        assert_eq!(summary.attempted_steps(), vec![RecoveryStep::Reconnect]);
        assert!(summary.retried);
        assert_eq!(launcher.calls("query"), 2);
        assert_eq!(orch.ledger_state()[&ErrorKind::ConnectivityFailure].attempts, 0);
    }

    #[tokio::test]
    async fn test_failed_retry_is_terminal() {
        let launcher = ScriptedLauncher::new(|op, _| match op {
            "query" => Reply::fail("permission denied"),
            _ => Reply::ok(Vec::new()),
        });
        let orch = orchestrator(1, &launcher);

        let outcome = orch.command("query", Vec::new(), Some(Duration::from_secs(5))).await;
        assert!(!outcome.success);
        assert_eq!(outcome.phase, RequestPhase::FailedTerminal);
        assert_eq!(outcome.error_kind.as_deref(), Some("AccessDenied"));

        let summary = outcome.recovery_summary.unwrap();
        assert!(summary.retried);
        assert_eq!(summary.retry_error.unwrap().message, "permission denied");
        assert_eq!(launcher.calls("query"), 2);
    }

    #[tokio::test]
    async fn test_reserved_operation_rejected() {
        let launcher = ScriptedLauncher::echo();
        let orch = orchestrator(1, &launcher);

        let outcome = orch.command("__shutdown", Vec::new(), None).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind.as_deref(), Some("MalformedOperation"));
        assert_eq!(launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_ledger_reported_as_max_attempts() {
        // Only the startup ping passes, so every recovery probe fails.
        let pings = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = pings.clone();
        let launcher = ScriptedLauncher::new(move |op, _| match op {
            "__ping" if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 => {
                Reply::ok(Vec::new())
            }
            "__ping" => Reply::fail("not ready"),
            _ => Reply::fail("no such table"),
        });
        let mut config = config(1);
        config.recovery.max_attempts = 1;
        config
            .recovery
            .strategies
            .insert(ErrorKind::Unclassified, vec![RecoveryStep::NotifyOperator]);
        let orch = Orchestrator::new(config, Arc::new(launcher.clone()));

        let first = orch.command("query", Vec::new(), Some(Duration::from_secs(5))).await;
        assert_eq!(first.error_kind.as_deref(), Some("Unclassified"));
        let summary = first.recovery_summary.unwrap();
        assert_eq!(summary.outcome, RecoveryOutcome::Failed);
        assert!(!summary.retried);
        assert_eq!(orch.ledger_state()[&ErrorKind::Unclassified].attempts, 1);

        let second = orch.command("query", Vec::new(), Some(Duration::from_secs(5))).await;
        assert_eq!(second.error_kind.as_deref(), Some("MaxAttemptsExceeded"));
        assert_eq!(
            second.recovery_summary.unwrap().outcome,
            RecoveryOutcome::MaxAttemptsExceeded
        );

        orch.reset_ledger(Some(ErrorKind::Unclassified));
        assert_eq!(orch.ledger_state()[&ErrorKind::Unclassified].attempts, 0);
    }

    #[tokio::test]
    async fn test_health_event_triggers_resource_recovery() {
        let launcher = ScriptedLauncher::echo();
        let orch = orchestrator(1, &launcher);
        orch.pool().warm_up().await;

        let event = HealthEvent {
            severity: Severity::Critical,
            resource: herdsman_core::Resource::Memory,
            utilization: 0.95,
            threshold: 0.90,
            snapshot: HealthSnapshot::now(ResourceUsage::new(0.1, 0.95, 0.1)),
        };
        let report = orch.handle_health_event(&event).await.unwrap();
        assert_eq!(report.classification.kind, ErrorKind::ResourceExhaustion);
        assert_eq!(report.outcome, RecoveryOutcome::Recovered);
        assert_eq!(launcher.calls("__cleanup"), 1);

        let advisory = HealthEvent {
            severity: Severity::Advisory,
            ..event
        };
        assert!(orch.handle_health_event(&advisory).await.is_none());
    }

    #[tokio::test]
    async fn test_start_samples_and_shutdown_stops() {
        let launcher = ScriptedLauncher::echo();
        let mut config = config(1);
        config.health.interval_ms = 10;
        let orch = Orchestrator::new(config, Arc::new(launcher.clone()));

        orch.start(Box::new(FixedProbe::new(ResourceUsage::new(0.1, 0.1, 0.1))))
            .await;
        while orch.health_snapshot().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        orch.shutdown().await;
        assert_eq!(launcher.shutdowns(), 1);
        let outcome = orch.command("echo", Vec::new(), None).await;
        assert_eq!(outcome.error_kind.as_deref(), Some("ShuttingDown"));
    }
}
