use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use jobforge_core::{CoreError, CoreResult, ErrorKind, SharedClock, TaskId};
use jobforge_observability::{Metrics, names};

use super::storage::{WalStorage, WalStorageError};
use super::types::{CheckpointReport, ReplayDisposition, ReplayReport, WalEntry, WalRecord, WalStatus};

/// Re-applies (or restores) the effect of a pending entry.
pub type ReplayHandler = Arc<dyn Fn(&WalEntry) -> Result<ReplayDisposition, String> + Send + Sync>;

#[derive(Debug, Default)]
struct WalState {
    entries: BTreeMap<u64, WalEntry>,
    last_sequence: u64,
}

/// Write-ahead log.
///
/// An intended effect is appended (and durable) before it is applied and
/// committed after. Pending entries are the recovery work list: `replay`
/// hands each to the handler registered for its kind.
pub struct WriteAheadLog {
    storage: Arc<dyn WalStorage>,
    state: Mutex<WalState>,
    handlers: RwLock<HashMap<String, ReplayHandler>>,
    replay_guard: Mutex<()>,
    /// Entries restored by this process; never replayed twice.
    replayed: Mutex<HashSet<u64>>,
    clock: SharedClock,
    metrics: Arc<Metrics>,
    retention: Duration,
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

fn storage_error(err: WalStorageError) -> CoreError {
    match err {
        WalStorageError::UnknownSequence(seq) => CoreError::not_found(format!("wal entry {seq}")),
        other => CoreError::durability(other.to_string()),
    }
}

impl WriteAheadLog {
    /// Load existing entries from `storage`.
    pub fn open(
        storage: Arc<dyn WalStorage>,
        clock: SharedClock,
        metrics: Arc<Metrics>,
        retention: Duration,
    ) -> CoreResult<Self> {
        let snapshot = storage.load().map_err(storage_error)?;
        let last_sequence = snapshot
            .entries
            .iter()
            .map(|e| e.sequence_number)
            .max()
            .unwrap_or(0)
            .max(snapshot.last_sequence);
        let entries: BTreeMap<u64, WalEntry> = snapshot
            .entries
            .into_iter()
            .map(|e| (e.sequence_number, e))
            .collect();

        let pending = entries.values().filter(|e| e.is_pending()).count();
        info!(entries = entries.len(), pending, last_sequence, "write-ahead log opened");

        Ok(Self {
            storage,
            state: Mutex::new(WalState {
                entries,
                last_sequence,
            }),
            handlers: RwLock::new(HashMap::new()),
            replay_guard: Mutex::new(()),
            replayed: Mutex::new(HashSet::new()),
            clock,
            metrics,
            retention,
        })
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, WalState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::transient("wal state lock poisoned"))
    }

    /// Durably record an intended effect. Callers must not apply the effect
    /// when this fails.
    pub fn append(&self, record: WalRecord) -> CoreResult<u64> {
        let started = Instant::now();
        let mut state = self.lock()?;
        let sequence_number = state.last_sequence + 1;
        let entry = WalEntry::from_record(sequence_number, record, self.clock.now());

        if let Err(e) = self.storage.append(&entry) {
            self.metrics
                .incr_labeled(names::ERRORS, ErrorKind::DurabilityFailure.as_str());
            error!(sequence_number, kind = %entry.kind, error = %e, "wal append failed");
            return Err(CoreError::durability(e.to_string()));
        }

        state.last_sequence = sequence_number;
        debug!(sequence_number, kind = %entry.kind, "wal entry appended");
        state.entries.insert(sequence_number, entry);
        drop(state);

        self.metrics.incr(names::WAL_APPENDS);
        self.metrics.observe(names::STAGE_WAL_APPEND, started.elapsed());
        Ok(sequence_number)
    }

    /// Mark an entry's effect as applied. Committing twice is a no-op.
    pub fn commit(&self, sequence_number: u64) -> CoreResult<()> {
        self.commit_inner(sequence_number, None)
    }

    pub fn commit_with_result(&self, sequence_number: u64, result: Value) -> CoreResult<()> {
        self.commit_inner(sequence_number, Some(result))
    }

    fn commit_inner(&self, sequence_number: u64, result: Option<Value>) -> CoreResult<()> {
        let mut state = self.lock()?;
        let last_sequence = state.last_sequence;
        let Some(entry) = state.entries.get_mut(&sequence_number) else {
            // Only committed entries are ever reclaimed.
            if sequence_number >= 1 && sequence_number <= last_sequence {
                return Ok(());
            }
            return Err(CoreError::not_found(format!("wal entry {sequence_number}")));
        };
        if entry.status == WalStatus::Committed {
            return Ok(());
        }

        let now = self.clock.now();
        self.storage
            .mark_committed(sequence_number, now, result.as_ref())
            .map_err(storage_error)?;
        entry.mark_committed(now, result);
        debug!(sequence_number, kind = %entry.kind, "wal entry committed");
        Ok(())
    }

    /// Register the replay handler for entries of `kind`.
    pub fn register_replay_handler<F>(&self, kind: impl Into<String>, handler: F) -> CoreResult<()>
    where
        F: Fn(&WalEntry) -> Result<ReplayDisposition, String> + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| CoreError::transient("wal handler lock poisoned"))?;
        handlers.insert(kind.into(), Arc::new(handler));
        Ok(())
    }

    /// Scan pending entries in sequence order and hand each to its handler.
    ///
    /// Single threaded: a second concurrent call fails with a transient
    /// error instead of waiting.
    pub fn replay(&self) -> CoreResult<ReplayReport> {
        let _guard = match self.replay_guard.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                return Err(CoreError::transient("wal replay already in progress"));
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let started = Instant::now();

        let pending = self.pending()?;
        let handlers = self
            .handlers
            .read()
            .map_err(|_| CoreError::transient("wal handler lock poisoned"))?
            .clone();

        let mut report = ReplayReport {
            total: pending.len(),
            ..ReplayReport::default()
        };

        for entry in pending {
            let seq = entry.sequence_number;
            if self.already_replayed(seq)? {
                report.skipped += 1;
                continue;
            }
            let Some(handler) = handlers.get(&entry.kind) else {
                warn!(sequence_number = seq, kind = %entry.kind, "no replay handler, entry skipped");
                report.skipped += 1;
                continue;
            };

            match handler(&entry) {
                Ok(ReplayDisposition::Commit) => {
                    self.commit(seq)?;
                    self.mark_replayed(seq)?;
                    report.applied += 1;
                }
                Ok(ReplayDisposition::Defer) => {
                    self.mark_replayed(seq)?;
                    report.deferred += 1;
                }
                Err(e) => {
                    self.metrics
                        .incr_labeled(names::ERRORS, ErrorKind::Transient.as_str());
                    error!(sequence_number = seq, kind = %entry.kind, error = %e, "wal replay failed");
                    report.failed += 1;
                }
            }
        }

        self.metrics.add(
            names::WAL_REPLAYED,
            "",
            (report.applied + report.deferred) as u64,
        );
        self.metrics.observe(names::STAGE_REPLAY, started.elapsed());
        info!(
            total = report.total,
            applied = report.applied,
            deferred = report.deferred,
            skipped = report.skipped,
            failed = report.failed,
            "wal replay finished"
        );
        Ok(report)
    }

    fn already_replayed(&self, seq: u64) -> CoreResult<bool> {
        Ok(self
            .replayed
            .lock()
            .map_err(|_| CoreError::transient("wal replay set poisoned"))?
            .contains(&seq))
    }

    fn mark_replayed(&self, seq: u64) -> CoreResult<()> {
        self.replayed
            .lock()
            .map_err(|_| CoreError::transient("wal replay set poisoned"))?
            .insert(seq);
        Ok(())
    }

    /// Reclaim committed entries older than the retention window.
    ///
    /// Entries sharing a correlation id with a pending entry are kept, so a
    /// half-finished saga can still be resumed from its full history.
    pub fn checkpoint(&self) -> CoreResult<CheckpointReport> {
        let mut state = self.lock()?;
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::zero());

        let open_groups: HashSet<String> = state
            .entries
            .values()
            .filter(|e| e.is_pending())
            .filter_map(|e| e.correlation_id.clone())
            .collect();

        let keep = |e: &WalEntry| {
            e.is_pending()
                || e.committed_at.is_none_or(|at| at > cutoff)
                || e
                    .correlation_id
                    .as_ref()
                    .is_some_and(|c| open_groups.contains(c))
        };
        let retain: Vec<WalEntry> = state.entries.values().filter(|e| keep(e)).cloned().collect();
        let reclaimed = state.entries.len() - retain.len();

        if reclaimed > 0 {
            self.storage
                .compact(&retain, state.last_sequence)
                .map_err(storage_error)?;
            state.entries = retain.iter().map(|e| (e.sequence_number, e.clone())).collect();
        }

        let report = CheckpointReport {
            reclaimed,
            retained: state.entries.len(),
            pending: state.entries.values().filter(|e| e.is_pending()).count(),
        };
        info!(
            reclaimed = report.reclaimed,
            retained = report.retained,
            pending = report.pending,
            "wal checkpoint"
        );
        Ok(report)
    }

    /// Pending entries in ascending sequence order.
    pub fn pending(&self) -> CoreResult<Vec<WalEntry>> {
        Ok(self
            .lock()?
            .entries
            .values()
            .filter(|e| e.is_pending())
            .cloned()
            .collect())
    }

    pub fn entries_for(&self, correlation_id: &str) -> CoreResult<Vec<WalEntry>> {
        Ok(self
            .lock()?
            .entries
            .values()
            .filter(|e| e.correlation_id.as_deref() == Some(correlation_id))
            .cloned()
            .collect())
    }

    /// The newest entry of `kind` recorded for `task_id`.
    pub fn latest_for_task(&self, kind: &str, task_id: TaskId) -> CoreResult<Option<WalEntry>> {
        Ok(self
            .lock()?
            .entries
            .values()
            .rev()
            .find(|e| e.kind == kind && e.task_id == Some(task_id))
            .cloned())
    }

    pub fn get(&self, sequence_number: u64) -> CoreResult<Option<WalEntry>> {
        Ok(self.lock()?.entries.get(&sequence_number).cloned())
    }

    pub fn last_sequence(&self) -> CoreResult<u64> {
        Ok(self.lock()?.last_sequence)
    }

    pub fn len(&self) -> CoreResult<usize> {
        Ok(self.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::FileWalStorage;
    use crate::wal::{FlakyWalStorage, InMemoryWalStorage};
    use jobforge_core::ManualClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wal_with(storage: Arc<dyn WalStorage>) -> (Arc<ManualClock>, WriteAheadLog) {
        let clock = ManualClock::starting_now();
        let wal = WriteAheadLog::open(
            storage,
            clock.clone(),
            Arc::new(Metrics::new()),
            Duration::from_secs(3600),
        )
        .unwrap();
        (clock, wal)
    }

    fn wal() -> (Arc<ManualClock>, WriteAheadLog) {
        wal_with(Arc::new(InMemoryWalStorage::new()))
    }

    #[test]
    fn sequence_numbers_increase_from_one() {
        let (_c, wal) = wal();
        assert_eq!(wal.append(WalRecord::new("k", json!(1))).unwrap(), 1);
        assert_eq!(wal.append(WalRecord::new("k", json!(2))).unwrap(), 2);
        assert_eq!(wal.last_sequence().unwrap(), 2);
    }

    #[test]
    fn commit_is_idempotent_and_unknown_is_an_error() {
        let (_c, wal) = wal();
        let seq = wal.append(WalRecord::new("k", json!({}))).unwrap();
        wal.commit(seq).unwrap();
        wal.commit(seq).unwrap();
        assert!(wal.pending().unwrap().is_empty());
        assert_eq!(wal.commit(99).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn failed_append_is_a_durability_failure() {
        let storage = Arc::new(FlakyWalStorage::default());
        storage.set_failing(true);
        let (_c, wal) = wal_with(storage.clone());

        let err = wal.append(WalRecord::new("k", json!({}))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DurabilityFailure);
        assert_eq!(wal.last_sequence().unwrap(), 0);

        storage.set_failing(false);
        assert_eq!(wal.append(WalRecord::new("k", json!({}))).unwrap(), 1);
    }

    #[test]
    fn replay_applies_each_pending_entry_exactly_once() {
        let (_c, wal) = wal();
        let applied = Arc::new(AtomicUsize::new(0));
        let counter = applied.clone();
        wal.register_replay_handler("effect", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ReplayDisposition::Commit)
        })
        .unwrap();

        let done = wal.append(WalRecord::new("effect", json!(1))).unwrap();
        wal.commit(done).unwrap();
        wal.append(WalRecord::new("effect", json!(2))).unwrap();
        wal.append(WalRecord::new("effect", json!(3))).unwrap();
        wal.append(WalRecord::new("orphan", json!(4))).unwrap();

        let report = wal.replay().unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.applied, 2);
        assert_eq!(report.skipped, 1);

        let again = wal.replay().unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(applied.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn deferred_entries_stay_pending_but_are_not_replayed_twice() {
        let (_c, wal) = wal();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        wal.register_replay_handler("task.submit", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ReplayDisposition::Defer)
        })
        .unwrap();
        wal.append(WalRecord::new("task.submit", json!({}))).unwrap();

        assert_eq!(wal.replay().unwrap().deferred, 1);
        assert_eq!(wal.pending().unwrap().len(), 1);
        assert_eq!(wal.replay().unwrap().skipped, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_replay_is_retried_on_the_next_pass() {
        let (_c, wal) = wal();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        wal.register_replay_handler("effect", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("downstream unavailable".into())
            } else {
                Ok(ReplayDisposition::Commit)
            }
        })
        .unwrap();
        wal.append(WalRecord::new("effect", json!({}))).unwrap();

        assert_eq!(wal.replay().unwrap().failed, 1);
        assert_eq!(wal.replay().unwrap().applied, 1);
        assert!(wal.pending().unwrap().is_empty());
    }

    #[test]
    fn checkpoint_respects_retention_and_open_groups() {
        let (clock, wal) = wal();
        let old = wal.append(WalRecord::new("k", json!({}))).unwrap();
        let saga_done = wal
            .append(WalRecord::new("saga.step", json!({})).with_correlation("saga:1"))
            .unwrap();
        wal.append(WalRecord::new("saga.step", json!({})).with_correlation("saga:1"))
            .unwrap();
        wal.commit(old).unwrap();
        wal.commit(saga_done).unwrap();

        clock.advance(Duration::from_secs(3601));
        let recent = wal.append(WalRecord::new("k", json!({}))).unwrap();
        wal.commit(recent).unwrap();

        let report = wal.checkpoint().unwrap();
        assert_eq!(report.reclaimed, 1);
        assert!(wal.get(old).unwrap().is_none());
        assert!(wal.get(saga_done).unwrap().is_some());
        assert!(wal.get(recent).unwrap().is_some());

        // Reclaimed entries were committed, so committing again is harmless.
        wal.commit(old).unwrap();
    }

    #[test]
    fn pending_entries_survive_a_restart() {
        let path = std::env::temp_dir()
            .join(format!("jobforge-wal-{}", jobforge_core::TaskId::new()))
            .join("wal.jsonl");
        {
            let storage = Arc::new(FileWalStorage::open(&path).unwrap());
            let (_c, wal) = wal_with(storage);
            let a = wal.append(WalRecord::new("k", json!("a"))).unwrap();
            wal.append(WalRecord::new("k", json!("b"))).unwrap();
            wal.commit(a).unwrap();
        }

        let (_c, wal) = wal_with(Arc::new(FileWalStorage::open(&path).unwrap()));
        let pending = wal.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].intended_effects, json!("b"));
        assert_eq!(wal.append(WalRecord::new("k", json!("c"))).unwrap(), 3);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
