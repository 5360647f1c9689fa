//! Fixed-size pool of worker handles.
//!
//! Each slot owns at most one [`WorkerHandle`] behind its own lock, so work
//! on one worker never blocks another. Idle slots wait in a FIFO queue
//! guarded by a semaphore whose permits equal the number of idle slots.
//! Workers are spawned lazily on first lease and respawned when a lease finds
//! a dead one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use herdsman_core::{RawError, Request, Response, WorkerId, WorkerState};
use herdsman_ipc::protocol::OP_PING;
use herdsman_ipc::{HandleOptions, IpcError, WorkerHandle, WorkerLauncher};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors returned when leasing a worker.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("No idle worker became available within {}ms", .waited.as_millis())]
    AcquireTimeout { waited: Duration },

    #[error("Worker pool is shut down")]
    ShuttingDown,

    #[error(transparent)]
    Launch(#[from] IpcError),
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerSummary {
    pub slot: usize,

    /// `None` until the slot's first worker is spawned.
    pub worker_id: Option<WorkerId>,
    pub state: Option<WorkerState>,
    pub busy: bool,
    pub operation_count: u64,
    pub restarts: u64,
    pub pid: Option<u32>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Replies gathered by [`WorkerPool::broadcast`].
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Live workers the operation was sent to.
    pub reached: usize,
    pub failures: Vec<RawError>,
}

struct Slot {
    index: usize,
    handle: Arc<AsyncMutex<Option<WorkerHandle>>>,
    cancel: Mutex<CancellationToken>,
    info: Mutex<WorkerSummary>,
}

impl Slot {
    fn new(index: usize) -> Self {
        Self {
            index,
            handle: Arc::new(AsyncMutex::new(None)),
            cancel: Mutex::new(CancellationToken::new()),
            info: Mutex::new(WorkerSummary {
                slot: index,
                ..Default::default()
            }),
        }
    }

    /// Mirror the handle into the summary so listings never wait on a lease.
    fn sync(&self, handle: Option<&WorkerHandle>, busy: bool) {
        let mut info = self.info.lock().unwrap_or_else(PoisonError::into_inner);
        match handle {
            Some(h) => {
                info.worker_id = Some(h.id().clone());
                info.state = Some(h.state());
                info.operation_count = h.operation_count();
                info.pid = h.pid();
                info.created_at = Some(h.created_at());
            }
            None => {
                info.state = info.worker_id.as_ref().map(|_| WorkerState::Dead);
                info.pid = None;
            }
        }
        info.busy = busy;
    }

    fn note_restart(&self) {
        let mut info = self.info.lock().unwrap_or_else(PoisonError::into_inner);
        info.restarts += 1;
    }

    fn summary(&self) -> WorkerSummary {
        self.info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn fresh_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    fn cancel(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

struct PoolShared {
    slots: Vec<Arc<Slot>>,
    idle: Mutex<VecDeque<usize>>,
    permits: Arc<Semaphore>,
    launcher: Arc<dyn WorkerLauncher>,
    options: HandleOptions,
    closed: AtomicBool,
}

impl PoolShared {
    fn release(&self, index: usize) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(index);
    }

    fn take_idle(&self) -> Option<usize> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    async fn spawn(&self, slot: &Slot) -> Result<WorkerHandle, IpcError> {
        let id = WorkerId::generate();
        debug!(slot = slot.index, worker_id = %id, "Spawning worker");
        WorkerHandle::spawn(id, self.launcher.as_ref(), self.options).await
    }
}

/// Exclusive use of one slot's worker. Returns the slot on drop.
pub struct WorkerLease {
    shared: Arc<PoolShared>,
    slot: Arc<Slot>,
    // Declared before the permit: the slot lock is released before the
    // permit, so the next acquirer never finds its slot still locked.
    handle: OwnedMutexGuard<Option<WorkerHandle>>,
    _permit: OwnedSemaphorePermit,
}

impl WorkerLease {
    pub fn slot(&self) -> usize {
        self.slot.index
    }

    pub fn worker_id(&self) -> Option<&WorkerId> {
        self.handle.as_ref().map(WorkerHandle::id)
    }

    pub fn state(&self) -> WorkerState {
        self.handle
            .as_ref()
            .map_or(WorkerState::Dead, WorkerHandle::state)
    }

    fn is_live(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Spawn a worker if the slot is empty or its worker is dead.
    async fn ensure_live(&mut self) -> Result<(), IpcError> {
        if self.is_live() {
            return Ok(());
        }
        let replacing = self.handle.is_some();
        if let Some(mut old) = self.handle.take() {
            old.terminate(false).await;
        }
        self.slot.sync(None, true);

        let handle = self.shared.spawn(&self.slot).await?;
        if replacing {
            self.slot.note_restart();
        }
        *self.handle = Some(handle);
        Ok(())
    }

    /// Submit on the leased worker. Cancellable through
    /// [`WorkerPool::cancel_in_flight`].
    pub async fn submit(&mut self, request: &Request) -> Result<Response, IpcError> {
        let token = self.slot.fresh_token();
        let Some(handle) = self.handle.as_mut() else {
            return Err(IpcError::NotReady(WorkerState::Dead));
        };
        self.slot.sync(Some(&*handle), true);
        let result = handle.submit_cancellable(request, &token).await;
        self.slot.sync(Some(&*handle), true);
        result
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.slot.sync(self.handle.as_ref(), false);
        self.shared.release(self.slot.index);
    }
}

/// Fixed-size worker pool. Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(size: usize, launcher: Arc<dyn WorkerLauncher>, options: HandleOptions) -> Self {
        let size = size.max(1);
        let slots = (0..size).map(|i| Arc::new(Slot::new(i))).collect();
        Self {
            shared: Arc::new(PoolShared {
                slots,
                idle: Mutex::new((0..size).collect()),
                permits: Arc::new(Semaphore::new(size)),
                launcher,
                options,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn idle_count(&self) -> usize {
        self.shared.permits.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Spawn workers for every empty idle slot. Returns how many started.
    pub async fn warm_up(&self) -> usize {
        let mut started = 0;
        for slot in &self.shared.slots {
            let Ok(mut guard) = slot.handle.clone().try_lock_owned() else {
                continue;
            };
            if guard.is_some() {
                continue;
            }
            match self.shared.spawn(slot).await {
                Ok(handle) => {
                    slot.sync(Some(&handle), false);
                    *guard = Some(handle);
                    started += 1;
                }
                Err(e) => warn!(slot = slot.index, error = %e, "Worker failed to start"),
            }
        }
        info!(started, size = self.size(), "Worker pool warmed up");
        started
    }

    /// Lease an idle worker, waiting until `deadline` for one to free up.
    pub async fn acquire(&self, deadline: Instant) -> Result<WorkerLease, PoolError> {
        let started = Instant::now();
        let timed_out = || PoolError::AcquireTimeout {
            waited: started.elapsed(),
        };

        if self.is_closed() {
            return Err(PoolError::ShuttingDown);
        }

        let permit = match tokio::time::timeout_at(
            deadline.into(),
            self.shared.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::ShuttingDown),
            Err(_) => {
                warn!(idle = self.idle_count(), "Timed out waiting for an idle worker");
                return Err(timed_out());
            }
        };

        let Some(index) = self.shared.take_idle() else {
            return Err(PoolError::ShuttingDown);
        };
        let slot = self.shared.slots[index].clone();

        let handle =
            match tokio::time::timeout_at(deadline.into(), slot.handle.clone().lock_owned()).await {
                Ok(guard) => guard,
                Err(_) => {
                    self.shared.release(index);
                    return Err(timed_out());
                }
            };

        let mut lease = WorkerLease {
            shared: self.shared.clone(),
            slot,
            handle,
            _permit: permit,
        };
        lease.ensure_live().await?;
        Ok(lease)
    }

    /// Lease slot `index` if it is idle, without waiting or spawning.
    fn try_acquire_slot(&self, index: usize) -> Option<WorkerLease> {
        if self.is_closed() {
            return None;
        }
        let permit = self.shared.permits.clone().try_acquire_owned().ok()?;
        {
            let mut idle = self.shared.idle.lock().unwrap_or_else(PoisonError::into_inner);
            let position = idle.iter().position(|&i| i == index)?;
            idle.remove(position);
        }
        let slot = self.shared.slots[index].clone();
        match slot.handle.clone().try_lock_owned() {
            Ok(handle) => Some(WorkerLease {
                shared: self.shared.clone(),
                slot,
                handle,
                _permit: permit,
            }),
            Err(_) => {
                self.shared.release(index);
                None
            }
        }
    }

    /// Send a reserved operation to every idle live worker.
    ///
    /// Workers are leased one at a time and released before the next, so at
    /// most one slot is withheld from callers. Each worker gets at most
    /// `per_worker` to answer. Busy workers are skipped; their in-flight
    /// requests are not disturbed.
    pub async fn broadcast(
        &self,
        operation: &str,
        deadline: Instant,
        per_worker: Duration,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for index in 0..self.size() {
            if Instant::now() >= deadline {
                break;
            }
            let Some(mut lease) = self.try_acquire_slot(index) else {
                continue;
            };
            if !lease.is_live() {
                continue;
            }

            report.reached += 1;
            let op_deadline = deadline.min(Instant::now() + per_worker);
            let request = Request::with_deadline(operation, Vec::new(), op_deadline);
            match lease.submit(&request).await {
                Ok(response) => {
                    if let Err(e) = response.into_result() {
                        report.failures.push(e);
                    }
                }
                Err(e) => {
                    warn!(slot = index, operation, error = %e, "Reserved operation failed");
                    report.failures.push(e.to_raw_error());
                }
            }
        }
        debug!(
            operation,
            reached = report.reached,
            failures = report.failures.len(),
            "Broadcast finished"
        );
        report
    }

    /// Cancel every in-flight request. Returns how many were signalled.
    pub fn cancel_in_flight(&self) -> usize {
        let mut cancelled = 0;
        for slot in &self.shared.slots {
            if slot.summary().busy {
                slot.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(cancelled, "Cancelled in-flight requests");
        }
        cancelled
    }

    /// Replace dead workers and the worker identified by `failed`.
    ///
    /// When neither exists, every idle live worker is recycled instead.
    /// Busy slots are never touched. Returns how many workers were restarted.
    pub async fn restart(&self, failed: Option<&WorkerId>) -> Result<usize, RawError> {
        let mut locked = Vec::new();
        for slot in &self.shared.slots {
            if let Ok(guard) = slot.handle.clone().try_lock_owned() {
                locked.push((slot.clone(), guard));
            }
        }

        let is_target = |handle: &Option<WorkerHandle>| match handle {
            Some(h) => h.state().is_terminal() || Some(h.id()) == failed,
            None => false,
        };
        let any_target = locked.iter().any(|(_, guard)| is_target(guard));

        let mut restarted = 0;
        let mut first_error = None;
        for (slot, mut guard) in locked {
            let target = if any_target {
                is_target(&guard)
            } else {
                guard.is_some()
            };
            if !target {
                continue;
            }

            if let Some(mut old) = guard.take() {
                let graceful = old.state().can_accept();
                info!(slot = slot.index, worker_id = %old.id(), "Restarting worker");
                old.terminate(graceful).await;
            }

            match self.shared.spawn(&slot).await {
                Ok(handle) => {
                    slot.note_restart();
                    slot.sync(Some(&handle), false);
                    *guard = Some(handle);
                    restarted += 1;
                }
                Err(e) => {
                    warn!(slot = slot.index, error = %e, "Replacement worker failed to start");
                    slot.sync(None, false);
                    first_error.get_or_insert_with(|| e.to_raw_error());
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(restarted),
        }
    }

    /// Lease a worker and ping it.
    pub async fn ping(&self, deadline: Instant) -> bool {
        let mut lease = match self.acquire(deadline).await {
            Ok(lease) => lease,
            Err(e) => {
                debug!(error = %e, "Probe could not lease a worker");
                return false;
            }
        };
        let request = Request::with_deadline(OP_PING, Vec::new(), deadline);
        matches!(lease.submit(&request).await, Ok(response) if response.success)
    }

    pub fn workers(&self) -> Vec<WorkerSummary> {
        self.shared.slots.iter().map(|slot| slot.summary()).collect()
    }

    /// Stop accepting leases, cancel in-flight requests and terminate every
    /// worker.
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(size = self.size(), "Shutting down worker pool");
        self.shared.permits.close();
        self.cancel_in_flight();

        for slot in &self.shared.slots {
            let mut guard = slot.handle.lock().await;
            if let Some(mut handle) = guard.take() {
                handle.terminate(true).await;
            }
            slot.sync(None, false);
        }
    }
}
