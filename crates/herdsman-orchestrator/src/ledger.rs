//! Per-kind recovery attempt ledger.
//!
//! Counts consecutive failed recoveries for each [`ErrorKind`]. A kind whose
//! counter reaches its maximum is refused until an operator resets it. Each
//! kind has its own execution lock so two recoveries of the same kind never
//! run concurrently while different kinds proceed in parallel.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use herdsman_core::{ErrorKind, LedgerEntryState};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

#[derive(Debug)]
struct LedgerEntry {
    max: u32,
    attempts: AtomicU32,
    exec: Arc<Mutex<()>>,
}

impl LedgerEntry {
    fn new(max: u32) -> Self {
        Self {
            max,
            attempts: AtomicU32::new(0),
            exec: Arc::new(Mutex::new(())),
        }
    }

    fn state(&self) -> LedgerEntryState {
        LedgerEntryState {
            attempts: self.attempts.load(Ordering::SeqCst),
            max: self.max,
        }
    }
}

/// Exclusive right to run recovery for one kind.
///
/// Counter updates go through the guard so they are serialized with the
/// recovery they describe.
#[derive(Debug)]
pub struct LedgerGuard {
    kind: ErrorKind,
    entry: Arc<LedgerEntry>,
    _exec: OwnedMutexGuard<()>,
}

impl LedgerGuard {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn state(&self) -> LedgerEntryState {
        self.entry.state()
    }

    pub fn is_exhausted(&self) -> bool {
        self.state().is_exhausted()
    }

    /// A successful recovery clears the counter.
    pub fn record_success(&self) {
        self.entry.attempts.store(0, Ordering::SeqCst);
    }

    /// A failed recovery adds one, saturating at the maximum.
    pub fn record_failure(&self) -> LedgerEntryState {
        let max = self.entry.max;
        let _ = self
            .entry
            .attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some((n + 1).min(max)));
        self.state()
    }
}

/// Recovery attempt counters keyed by error kind.
#[derive(Debug)]
pub struct RecoveryLedger {
    default_max: u32,
    overrides: HashMap<ErrorKind, u32>,
    entries: RwLock<HashMap<ErrorKind, Arc<LedgerEntry>>>,
}

impl RecoveryLedger {
    pub fn new(default_max: u32) -> Self {
        Self {
            default_max,
            overrides: HashMap::new(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Use a different maximum for one kind.
    pub fn with_max(mut self, kind: ErrorKind, max: u32) -> Self {
        self.overrides.insert(kind, max);
        self
    }

    pub fn max_for(&self, kind: ErrorKind) -> u32 {
        self.overrides.get(&kind).copied().unwrap_or(self.default_max)
    }

    fn entry(&self, kind: ErrorKind) -> Arc<LedgerEntry> {
        if let Some(entry) = self.entries.read().ok().and_then(|m| m.get(&kind).cloned()) {
            return entry;
        }
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries
            .entry(kind)
            .or_insert_with(|| Arc::new(LedgerEntry::new(self.max_for(kind))))
            .clone()
    }

    /// Wait for the execution lock of `kind`, giving up at `deadline`.
    pub async fn acquire(&self, kind: ErrorKind, deadline: Instant) -> Option<LedgerGuard> {
        let entry = self.entry(kind);
        let exec = tokio::time::timeout_at(deadline.into(), entry.exec.clone().lock_owned())
            .await
            .ok()?;
        Some(LedgerGuard {
            kind,
            entry,
            _exec: exec,
        })
    }

    /// Counter state for `kind`. Kinds never seen report zero attempts.
    pub fn entry_state(&self, kind: ErrorKind) -> LedgerEntryState {
        self.entries
            .read()
            .ok()
            .and_then(|m| m.get(&kind).map(|e| e.state()))
            .unwrap_or(LedgerEntryState {
                attempts: 0,
                max: self.max_for(kind),
            })
    }

    /// Counter state for every kind. Never blocks on running recoveries.
    pub fn state(&self) -> BTreeMap<ErrorKind, LedgerEntryState> {
        ErrorKind::ALL
            .into_iter()
            .map(|kind| (kind, self.entry_state(kind)))
            .collect()
    }

    /// Zero one kind, or all kinds when `kind` is `None`.
    pub fn reset(&self, kind: Option<ErrorKind>) {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match kind {
            Some(kind) => {
                if let Some(entry) = entries.get(&kind) {
                    entry.attempts.store(0, Ordering::SeqCst);
                }
                info!(error_kind = %kind, "Recovery ledger reset");
            }
            None => {
                for entry in entries.values() {
                    entry.attempts.store(0, Ordering::SeqCst);
                }
                info!("Recovery ledger reset for all kinds");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[tokio::test]
    async fn test_unknown_kind_reports_zero() {
        let ledger = RecoveryLedger::new(3);
        let state = ledger.entry_state(ErrorKind::AccessDenied);
        assert_eq!(state.attempts, 0);
        assert_eq!(state.max, 3);
        assert_eq!(ledger.state().len(), ErrorKind::ALL.len());
    }

    #[tokio::test]
    async fn test_failure_increments_and_saturates() {
        let ledger = RecoveryLedger::new(2);
        let guard = ledger.acquire(ErrorKind::Unclassified, soon()).await.unwrap();
        assert_eq!(guard.record_failure().attempts, 1);
        assert_eq!(guard.record_failure().attempts, 2);
        assert!(guard.is_exhausted());
        assert_eq!(guard.record_failure().attempts, 2);
    }

    #[tokio::test]
    async fn test_success_clears_counter() {
        let ledger = RecoveryLedger::new(3);
        let guard = ledger.acquire(ErrorKind::ResourceExhaustion, soon()).await.unwrap();
        guard.record_failure();
        guard.record_failure();
        guard.record_success();
        assert_eq!(ledger.entry_state(ErrorKind::ResourceExhaustion).attempts, 0);
    }

    #[tokio::test]
    async fn test_reset_one_and_all() {
        let ledger = RecoveryLedger::new(3);
        for kind in [ErrorKind::AccessDenied, ErrorKind::DeadlineExceeded] {
            let guard = ledger.acquire(kind, soon()).await.unwrap();
            guard.record_failure();
        }

        ledger.reset(Some(ErrorKind::AccessDenied));
        assert_eq!(ledger.entry_state(ErrorKind::AccessDenied).attempts, 0);
        assert_eq!(ledger.entry_state(ErrorKind::DeadlineExceeded).attempts, 1);

        ledger.reset(None);
        assert_eq!(ledger.entry_state(ErrorKind::DeadlineExceeded).attempts, 0);
    }

    #[tokio::test]
    async fn test_per_kind_max() {
        let ledger = RecoveryLedger::new(3).with_max(ErrorKind::AccessDenied, 1);
        assert_eq!(ledger.max_for(ErrorKind::AccessDenied), 1);
        assert_eq!(ledger.max_for(ErrorKind::Unclassified), 3);
    }

    #[tokio::test]
    async fn test_same_kind_is_exclusive() {
        let ledger = RecoveryLedger::new(3);
        let _held = ledger.acquire(ErrorKind::DeadlineExceeded, soon()).await.unwrap();

        let blocked = ledger
            .acquire(ErrorKind::DeadlineExceeded, Instant::now() + Duration::from_millis(50))
            .await;
        assert!(blocked.is_none());

        // A different kind is not blocked, and state reads never block.
        assert!(ledger.acquire(ErrorKind::AccessDenied, soon()).await.is_some());
        assert_eq!(ledger.state()[&ErrorKind::DeadlineExceeded].attempts, 0);
    }
}
