//! Idempotency keys for task submission.
//!
//! The first caller to present a key claims it (`New`); later callers see
//! the claim (`InProgress`) or, once the owner completed, the cached result
//! (`Completed`). Checks are synchronous and atomic under one mutex, so two
//! racing submissions can never both observe `New`.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use jobforge_core::{CoreError, CoreResult, SharedClock, TaskId};
use jobforge_observability::{Metrics, names};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub owner: TaskId,
    pub status: IdempotencyStatus,
    pub fingerprint: Option<String>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of presenting a key.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// The caller now owns the key.
    New,
    /// Another submission owns the key and has not finished.
    InProgress { owner: TaskId },
    /// The owner finished within the TTL.
    Completed { owner: TaskId, result: Value },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdempotencyStats {
    pub entries: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Stable fingerprint of a request body.
pub fn fingerprint(parts: &Value) -> String {
    let mut hasher = DefaultHasher::new();
    // serde_json maps are ordered, so equal requests serialize identically.
    parts.to_string().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Reports whether a claim's owner task is still queued, retrying or running.
pub type OwnerLiveness = Arc<dyn Fn(TaskId) -> bool + Send + Sync>;

pub struct IdempotencyManager {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
    clock: SharedClock,
    metrics: Arc<Metrics>,
    result_ttl: Duration,
    in_progress_ttl: Duration,
    owner_alive: Option<OwnerLiveness>,
}

impl std::fmt::Debug for IdempotencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyManager")
            .field("result_ttl", &self.result_ttl)
            .field("in_progress_ttl", &self.in_progress_ttl)
            .finish_non_exhaustive()
    }
}

fn after(at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl IdempotencyManager {
    pub fn new(
        clock: SharedClock,
        metrics: Arc<Metrics>,
        result_ttl: Duration,
        in_progress_ttl: Duration,
    ) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
            metrics,
            result_ttl,
            in_progress_ttl,
            owner_alive: None,
        }
    }

    /// An in-progress claim whose owner is still live never expires; its
    /// deadline is pushed out instead.
    pub fn with_owner_liveness<F>(mut self, alive: F) -> Self
    where
        F: Fn(TaskId) -> bool + Send + Sync + 'static,
    {
        self.owner_alive = Some(Arc::new(alive));
        self
    }

    /// Whether `record` has lapsed at `now`. Extends the claim of a live
    /// owner as a side effect.
    fn lapsed(&self, record: &mut IdempotencyRecord, now: DateTime<Utc>) -> bool {
        if record.expires_at > now {
            return false;
        }
        let owner_live = record.status == IdempotencyStatus::InProgress
            && self.owner_alive.as_ref().is_some_and(|alive| alive(record.owner));
        if owner_live {
            debug!(key = %record.key, task_id = %record.owner, "claim outlived its ttl, owner still live");
            record.expires_at = after(now, self.in_progress_ttl);
            return false;
        }
        true
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, HashMap<String, IdempotencyRecord>>> {
        self.records
            .lock()
            .map_err(|_| CoreError::transient("idempotency store poisoned"))
    }

    pub fn begin(&self, key: &str, owner: TaskId) -> CoreResult<BeginOutcome> {
        self.begin_inner(key, owner, None)
    }

    /// Like [`begin`](Self::begin), but a key reused with a different request
    /// fingerprint is rejected.
    pub fn begin_with_fingerprint(
        &self,
        key: &str,
        owner: TaskId,
        fingerprint: &str,
    ) -> CoreResult<BeginOutcome> {
        self.begin_inner(key, owner, Some(fingerprint))
    }

    fn begin_inner(&self, key: &str, owner: TaskId, fingerprint: Option<&str>) -> CoreResult<BeginOutcome> {
        if key.is_empty() {
            return Err(CoreError::validation("idempotency key must not be empty"));
        }

        let now = self.clock.now();
        let mut records = self.lock()?;
        if records.get_mut(key).is_some_and(|r| self.lapsed(r, now)) {
            debug!(key, "idempotency record expired");
            records.remove(key);
        }

        if let Some(existing) = records.get(key) {
            if let (Some(stored), Some(given)) = (existing.fingerprint.as_deref(), fingerprint) {
                if stored != given {
                    return Err(CoreError::validation(format!(
                        "idempotency key '{key}' reused with a different request"
                    )));
                }
            }
            return Ok(match existing.status {
                IdempotencyStatus::InProgress => {
                    self.metrics.incr(names::IDEMPOTENCY_IN_FLIGHT);
                    BeginOutcome::InProgress {
                        owner: existing.owner,
                    }
                }
                IdempotencyStatus::Completed => {
                    self.metrics.incr(names::IDEMPOTENCY_HITS);
                    BeginOutcome::Completed {
                        owner: existing.owner,
                        result: existing.result.clone().unwrap_or(Value::Null),
                    }
                }
            });
        }

        records.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                owner,
                status: IdempotencyStatus::InProgress,
                fingerprint: fingerprint.map(str::to_string),
                result: None,
                created_at: now,
                expires_at: after(now, self.in_progress_ttl),
            },
        );
        self.metrics.incr(names::IDEMPOTENCY_MISSES);
        Ok(BeginOutcome::New)
    }

    /// Store the owner's result for the default TTL.
    ///
    /// A key that has since been claimed by another task is left to that
    /// task; the stale owner's result is dropped, not an error.
    pub fn complete(&self, key: &str, owner: TaskId, result: Value) -> CoreResult<()> {
        self.complete_with_ttl(key, owner, result, self.result_ttl)
    }

    pub fn complete_with_ttl(&self, key: &str, owner: TaskId, result: Value, ttl: Duration) -> CoreResult<()> {
        let now = self.clock.now();
        let mut records = self.lock()?;
        let record = records.entry(key.to_string()).or_insert_with(|| IdempotencyRecord {
            key: key.to_string(),
            owner,
            status: IdempotencyStatus::InProgress,
            fingerprint: None,
            result: None,
            created_at: now,
            expires_at: now,
        });
        if record.owner != owner {
            warn!(key, task_id = %owner, current_owner = %record.owner, "idempotency key was reclaimed, result not cached");
            return Ok(());
        }
        record.status = IdempotencyStatus::Completed;
        record.result = Some(result);
        record.expires_at = after(now, ttl);
        Ok(())
    }

    /// Drop `owner`'s in-progress claim so a later submission may proceed.
    /// Completed records and other owners' claims are left alone.
    pub fn release(&self, key: &str, owner: TaskId) -> CoreResult<bool> {
        let mut records = self.lock()?;
        let releasable = records
            .get(key)
            .is_some_and(|r| r.status == IdempotencyStatus::InProgress && r.owner == owner);
        if releasable {
            records.remove(key);
        }
        Ok(releasable)
    }

    pub fn lookup(&self, key: &str) -> CoreResult<Option<IdempotencyRecord>> {
        let now = self.clock.now();
        Ok(self
            .lock()?
            .get(key)
            .filter(|r| r.expires_at > now)
            .cloned())
    }

    /// Remove every expired record. Returns how many were removed.
    pub fn purge_expired(&self) -> CoreResult<usize> {
        let now = self.clock.now();
        let mut records = self.lock()?;
        let before = records.len();
        records.retain(|_, r| !self.lapsed(r, now));
        let purged = before - records.len();
        if purged > 0 {
            info!(purged, "expired idempotency records purged");
        }
        Ok(purged)
    }

    pub fn stats(&self) -> CoreResult<IdempotencyStats> {
        let records = self.lock()?;
        let in_progress = records
            .values()
            .filter(|r| r.status == IdempotencyStatus::InProgress)
            .count();
        Ok(IdempotencyStats {
            entries: records.len(),
            in_progress,
            completed: records.len() - in_progress,
            hits: self.metrics.counter(names::IDEMPOTENCY_HITS),
            misses: self.metrics.counter(names::IDEMPOTENCY_MISSES),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::ManualClock;
    use serde_json::json;

    fn manager() -> (Arc<ManualClock>, IdempotencyManager) {
        let clock = ManualClock::starting_now();
        let m = IdempotencyManager::new(
            clock.clone(),
            Arc::new(Metrics::new()),
            Duration::from_secs(3600),
            Duration::from_secs(60),
        );
        (clock, m)
    }

    #[test]
    fn first_claim_wins_then_in_progress_then_cached() {
        let (_c, m) = manager();
        let owner = TaskId::new();
        assert_eq!(m.begin("k", owner).unwrap(), BeginOutcome::New);
        assert_eq!(
            m.begin("k", TaskId::new()).unwrap(),
            BeginOutcome::InProgress { owner }
        );

        m.complete("k", owner, json!({"ok": true})).unwrap();
        assert_eq!(
            m.begin("k", TaskId::new()).unwrap(),
            BeginOutcome::Completed {
                owner,
                result: json!({"ok": true})
            }
        );
        let stats = m.stats().unwrap();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn results_expire_after_their_ttl() {
        let (clock, m) = manager();
        let owner = TaskId::new();
        m.begin("k", owner).unwrap();
        m.complete("k", owner, json!(1)).unwrap();

        clock.advance(Duration::from_secs(3601));
        assert_eq!(m.begin("k", TaskId::new()).unwrap(), BeginOutcome::New);
    }

    #[test]
    fn abandoned_claims_expire() {
        let (clock, m) = manager();
        m.begin("k", TaskId::new()).unwrap();
        clock.advance(Duration::from_secs(61));
        assert_eq!(m.begin("k", TaskId::new()).unwrap(), BeginOutcome::New);
    }

    #[test]
    fn release_frees_in_progress_only() {
        let (_c, m) = manager();
        let owner = TaskId::new();
        m.begin("a", owner).unwrap();
        assert!(!m.release("a", TaskId::new()).unwrap());
        assert!(m.release("a", owner).unwrap());
        assert_eq!(m.begin("a", TaskId::new()).unwrap(), BeginOutcome::New);

        let done = TaskId::new();
        m.begin("b", done).unwrap();
        m.complete("b", done, json!(null)).unwrap();
        assert!(!m.release("b", done).unwrap());
    }

    #[test]
    fn mismatched_fingerprint_is_rejected() {
        let (_c, m) = manager();
        let a = fingerprint(&json!({"name": "x", "args": [1]}));
        let b = fingerprint(&json!({"name": "x", "args": [2]}));
        assert_ne!(a, b);

        m.begin_with_fingerprint("k", TaskId::new(), &a).unwrap();
        assert!(matches!(
            m.begin_with_fingerprint("k", TaskId::new(), &b),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            m.begin_with_fingerprint("k", TaskId::new(), &a),
            Ok(BeginOutcome::InProgress { .. })
        ));
    }

    #[test]
    fn concurrent_begins_yield_exactly_one_new() {
        let (_c, m) = manager();
        let m = Arc::new(m);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || m.begin("race", TaskId::new()).unwrap())
            })
            .collect();
        let news = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| *o == BeginOutcome::New)
            .count();
        assert_eq!(news, 1);
    }

    #[test]
    fn purge_drops_expired_records() {
        let (clock, m) = manager();
        m.begin("short", TaskId::new()).unwrap();
        let owner = TaskId::new();
        m.begin("long", owner).unwrap();
        m.complete("long", owner, json!(1)).unwrap();

        clock.advance(Duration::from_secs(120));
        assert_eq!(m.purge_expired().unwrap(), 1);
        assert!(m.lookup("long").unwrap().is_some());
    }

    #[test]
    fn claim_of_a_live_owner_outlives_its_ttl() {
        let clock = ManualClock::starting_now();
        let live = Arc::new(Mutex::new(true));
        let flag = live.clone();
        let m = IdempotencyManager::new(
            clock.clone(),
            Arc::new(Metrics::new()),
            Duration::from_secs(3600),
            Duration::from_secs(60),
        )
        .with_owner_liveness(move |_| *flag.lock().unwrap());

        let owner = TaskId::new();
        m.begin("k", owner).unwrap();
        clock.advance(Duration::from_secs(61));
        assert_eq!(m.begin("k", TaskId::new()).unwrap(), BeginOutcome::InProgress { owner });
        assert_eq!(m.purge_expired().unwrap(), 0);

        *live.lock().unwrap() = false;
        clock.advance(Duration::from_secs(61));
        assert_eq!(m.begin("k", TaskId::new()).unwrap(), BeginOutcome::New);
    }

    #[test]
    fn completing_a_reclaimed_key_keeps_the_new_claim() {
        let (clock, m) = manager();
        let stale = TaskId::new();
        m.begin("k", stale).unwrap();
        clock.advance(Duration::from_secs(61));
        let fresh = TaskId::new();
        assert_eq!(m.begin("k", fresh).unwrap(), BeginOutcome::New);

        m.complete("k", stale, json!("late")).unwrap();
        let record = m.lookup("k").unwrap().unwrap();
        assert_eq!(record.owner, fresh);
        assert_eq!(record.status, IdempotencyStatus::InProgress);
        assert_eq!(record.result, None);
    }
}
