//! Recovery steps carried out against the worker pool.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use herdsman_core::{RawError, RecoveryStep};
use herdsman_ipc::protocol::{OP_CLEANUP, OP_RECONNECT, OP_VERIFY};
use tracing::{error, info};

use crate::pool::WorkerPool;
use crate::recovery::{BackoffPolicy, RecoveryActions, StepContext};

/// [`RecoveryActions`] backed by a [`WorkerPool`].
#[derive(Clone)]
pub struct PoolActions {
    pool: WorkerPool,
    backoff: BackoffPolicy,
    op_timeout: Duration,
}

impl PoolActions {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            pool,
            backoff: BackoffPolicy::default(),
            op_timeout: Duration::from_secs(1),
        }
    }

    /// Upper bound on each worker's answer to a reserved operation.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Send a reserved operation to the idle workers. The first worker
    /// failure becomes the step error so the classifier sees its message.
    async fn broadcast(&self, operation: &str, deadline: Instant) -> Result<(), RawError> {
        let report = self.pool.broadcast(operation, deadline, self.op_timeout).await;
        if let Some(failure) = report.failures.into_iter().next() {
            return Err(failure);
        }
        if report.reached == 0 {
            return Err(RawError::new(format!(
                "no idle worker accepted {operation}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RecoveryActions for PoolActions {
    async fn run_step(&self, step: RecoveryStep, ctx: &StepContext) -> Result<(), RawError> {
        match step {
            RecoveryStep::Backoff => {
                let delay = self.backoff.delay(ctx.attempts);
                let until = ctx.deadline.min(Instant::now() + delay);
                info!(delay_ms = delay.as_millis() as u64, "Backing off");
                tokio::time::sleep_until(until.into()).await;
                Ok(())
            }
            RecoveryStep::Cleanup => self.broadcast(OP_CLEANUP, ctx.deadline).await,
            RecoveryStep::Reconnect => self.broadcast(OP_RECONNECT, ctx.deadline).await,
            RecoveryStep::VerifyIntegrity => self.broadcast(OP_VERIFY, ctx.deadline).await,
            RecoveryStep::CancelOperations => {
                self.pool.cancel_in_flight();
                Ok(())
            }
            RecoveryStep::RestartWorker => {
                let restarted = self.pool.restart(ctx.failed_worker.as_ref()).await?;
                info!(restarted, "Workers restarted");
                Ok(())
            }
            RecoveryStep::NotifyOperator => {
                error!(
                    error_kind = %ctx.kind,
                    attempts = ctx.attempts,
                    failed_worker = ?ctx.failed_worker,
                    "Operator attention required"
                );
                Ok(())
            }
        }
    }

    async fn probe(&self, deadline: Instant) -> bool {
        self.pool.ping(deadline).await
    }
}
