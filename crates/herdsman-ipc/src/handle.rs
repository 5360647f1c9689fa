//! Worker process handle.

use std::time::Duration;

use chrono::{DateTime, Utc};
use herdsman_core::{Request, Response, WorkerId, WorkerState};
use tokio::process::Child;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{self, FrameChannel, FrameConfig};
use crate::error::IpcError;
use crate::launcher::WorkerLauncher;
use crate::protocol::{WireRequest, WireResponse, OP_PING, OP_SHUTDOWN};

/// Tunables for a single handle.
#[derive(Debug, Clone, Copy)]
pub struct HandleOptions {
    pub frame: FrameConfig,

    /// How long to wait for a late response after a timeout.
    pub drain_grace: Duration,

    /// How long a graceful terminate waits before killing.
    pub graceful_timeout: Duration,

    /// Startup ping budget; `None` skips the startup ping.
    pub startup_timeout: Option<Duration>,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            drain_grace: Duration::from_millis(100),
            graceful_timeout: Duration::from_secs(2),
            startup_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Owns one worker process and the frame channel to it.
///
/// Taking `&mut self` in [`submit`](Self::submit) keeps a single request in
/// flight per handle. Any transport failure moves the handle to `Dead`; it
/// never heals itself.
pub struct WorkerHandle {
    id: WorkerId,
    state: WorkerState,
    channel: FrameChannel,
    child: Option<Child>,
    options: HandleOptions,
    next_request_id: u64,
    operation_count: u64,
    created_at: DateTime<Utc>,
}

impl WorkerHandle {
    /// Launch a worker and wait for it to answer a startup ping.
    pub async fn spawn(
        id: WorkerId,
        launcher: &dyn WorkerLauncher,
        options: HandleOptions,
    ) -> Result<Self, IpcError> {
        let connection = launcher.launch(&id).await?;

        let mut handle = Self {
            id,
            state: WorkerState::Starting,
            channel: FrameChannel::new(connection.reader, connection.writer, options.frame),
            child: connection.child,
            options,
            next_request_id: 1,
            operation_count: 0,
            created_at: Utc::now(),
        };

        if let Some(budget) = options.startup_timeout {
            if let Err(e) = handle.startup_ping(budget).await {
                warn!(worker_id = %handle.id, error = %e, "Worker failed startup ping");
                handle.kill().await;
                handle.state = WorkerState::Dead;
                return Err(IpcError::Startup(e.to_string()));
            }
        }

        handle.state = WorkerState::Ready;
        info!(worker_id = %handle.id, pid = ?handle.pid(), "Worker ready");
        Ok(handle)
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Requests answered successfully at the transport level.
    pub fn operation_count(&self) -> u64 {
        self.operation_count
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Submit a request and wait for its response.
    ///
    /// A well-formed failure response is returned as `Ok`; only transport
    /// level failures are errors.
    pub async fn submit(&mut self, request: &Request) -> Result<Response, IpcError> {
        if !self.state.can_accept() {
            return Err(IpcError::NotReady(self.state));
        }
        if request.is_expired() {
            return Err(IpcError::Timeout {
                after: Duration::ZERO,
            });
        }

        self.state = WorkerState::Busy;
        let wire = self.next_wire(&request.operation, request.payload.clone(), request.remaining());
        debug!(
            worker_id = %self.id,
            request_id = wire.id,
            operation = %wire.operation,
            payload_len = wire.payload.len(),
            "Submitting request"
        );

        let deadline = Instant::from_std(request.deadline);
        let result =
            codec::exchange(&mut self.channel, &wire, deadline, self.options.drain_grace).await;
        self.finish(result)
    }

    /// Like [`submit`](Self::submit), but gives up as soon as `cancel` fires.
    ///
    /// A cancelled handle is `Dead`: the worker may still answer later and the
    /// stream can no longer be trusted.
    pub async fn submit_cancellable(
        &mut self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Response, IpcError> {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.submit(request) => Some(result),
        };

        match outcome {
            Some(result) => result,
            None => {
                self.mark_dead(&IpcError::Cancelled);
                Err(IpcError::Cancelled)
            }
        }
    }

    /// Stop the worker. Terminating a `Dead` handle is a no-op.
    ///
    /// Graceful termination sends the shutdown operation and waits up to
    /// `graceful_timeout` for the process to exit before killing it.
    pub async fn terminate(&mut self, graceful: bool) {
        if self.state.is_terminal() {
            debug!(worker_id = %self.id, "Terminate on dead worker ignored");
            return;
        }

        info!(worker_id = %self.id, graceful, "Terminating worker");
        self.state = WorkerState::Terminating;

        if graceful {
            let deadline = Instant::now() + self.options.graceful_timeout;
            let wire = self.next_wire(OP_SHUTDOWN, Vec::new(), self.options.graceful_timeout);
            if let Err(e) = codec::exchange(&mut self.channel, &wire, deadline, Duration::ZERO).await
            {
                debug!(worker_id = %self.id, error = %e, "Shutdown request not acknowledged");
            }

            if let Some(child) = self.child.as_mut() {
                match timeout_at(deadline, child.wait()).await {
                    Ok(Ok(status)) => {
                        info!(worker_id = %self.id, exit_code = ?status.code(), "Worker exited");
                    }
                    _ => {
                        warn!(worker_id = %self.id, "Worker did not exit in time, killing");
                        self.kill().await;
                    }
                }
            }
        } else {
            self.kill().await;
        }

        self.state = WorkerState::Dead;
    }

    async fn startup_ping(&mut self, budget: Duration) -> Result<(), IpcError> {
        let wire = self.next_wire(OP_PING, Vec::new(), budget);
        let deadline = Instant::now() + budget;
        let response =
            codec::exchange(&mut self.channel, &wire, deadline, self.options.drain_grace).await?;
        if response.success {
            Ok(())
        } else {
            let reason = response
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "ping rejected".to_string());
            Err(IpcError::Startup(reason))
        }
    }

    fn next_wire(&mut self, operation: &str, payload: Vec<u8>, remaining: Duration) -> WireRequest {
        let id = self.next_request_id;
        self.next_request_id += 1;
        WireRequest {
            id,
            operation: operation.to_string(),
            payload,
            deadline_ms: u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn finish(&mut self, result: Result<WireResponse, IpcError>) -> Result<Response, IpcError> {
        match result {
            Ok(wire) => {
                self.state = WorkerState::Ready;
                self.operation_count += 1;
                Ok(wire.into())
            }
            Err(e) if !e.is_fatal() => {
                self.state = WorkerState::Ready;
                Err(e)
            }
            Err(e) => {
                let e = self.with_exit_code(e);
                self.mark_dead(&e);
                Err(e)
            }
        }
    }

    /// Attach the process exit code to a transport error if it already exited.
    fn with_exit_code(&mut self, err: IpcError) -> IpcError {
        match err {
            IpcError::Transport {
                reason,
                exit_code: None,
            } => {
                let exit_code = self
                    .child
                    .as_mut()
                    .and_then(|child| child.try_wait().ok().flatten())
                    .and_then(|status| status.code());
                IpcError::Transport { reason, exit_code }
            }
            other => other,
        }
    }

    fn mark_dead(&mut self, cause: &IpcError) {
        warn!(worker_id = %self.id, error = %cause, "Worker marked dead");
        self.state = WorkerState::Dead;
        // A dead handle never serves again, so the process must not linger.
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                debug!(worker_id = %self.id, error = %e, "Kill skipped, process already gone");
            }
        }
    }

    async fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.kill().await {
                debug!(worker_id = %self.id, error = %e, "Kill failed, process likely exited");
            }
        }
    }
}
