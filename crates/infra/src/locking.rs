//! Optimistic lock manager for shared records.
//!
//! Writers read `(value, version)`, do their work without holding any lock,
//! and write back with the version they read. Exactly one of several
//! concurrent writers carrying the same expectation wins; the others get a
//! `VersionConflict` and decide for themselves whether to re-read. The
//! manager never retries on their behalf.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use jobforge_core::{CoreError, CoreResult, ErrorKind, ExpectedVersion, SharedClock};
use jobforge_observability::{Metrics, names};

/// A value with the version it was read at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Versioned<V> {
    pub value: V,
    pub version: u64,
}

/// Version bookkeeping for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockRecord {
    pub resource_id: String,
    pub version: u64,
    pub last_writer: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    record: LockRecord,
}

/// One item of a batch write.
#[derive(Debug, Clone)]
pub struct BatchWrite<V> {
    pub resource_id: String,
    pub value: V,
    pub expected: ExpectedVersion,
}

pub struct OptimisticLockManager<V> {
    slots: RwLock<HashMap<String, Slot<V>>>,
    clock: SharedClock,
    metrics: Arc<Metrics>,
}

impl<V> std::fmt::Debug for OptimisticLockManager<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticLockManager").finish_non_exhaustive()
    }
}

impl<V: Clone + Send + Sync> OptimisticLockManager<V> {
    pub fn new(clock: SharedClock, metrics: Arc<Metrics>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            clock,
            metrics,
        }
    }

    fn read_slots(&self) -> CoreResult<RwLockReadGuard<'_, HashMap<String, Slot<V>>>> {
        self.slots
            .read()
            .map_err(|_| CoreError::transient("lock manager poisoned"))
    }

    fn write_slots(&self) -> CoreResult<RwLockWriteGuard<'_, HashMap<String, Slot<V>>>> {
        self.slots
            .write()
            .map_err(|_| CoreError::transient("lock manager poisoned"))
    }

    fn conflict(&self, err: CoreError) -> CoreError {
        self.metrics.incr(names::VERSION_CONFLICTS);
        self.metrics
            .incr_labeled(names::ERRORS, ErrorKind::VersionConflict.as_str());
        err
    }

    /// Current value and version. Unknown resources are `NotFound`.
    pub fn read(&self, resource_id: &str) -> CoreResult<Versioned<V>> {
        let slots = self.read_slots()?;
        let slot = slots
            .get(resource_id)
            .ok_or_else(|| CoreError::not_found(format!("resource '{resource_id}'")))?;
        Ok(Versioned {
            value: slot.value.clone(),
            version: slot.record.version,
        })
    }

    /// Current version; 0 when absent.
    pub fn version(&self, resource_id: &str) -> CoreResult<u64> {
        Ok(self
            .read_slots()?
            .get(resource_id)
            .map(|s| s.record.version)
            .unwrap_or(0))
    }

    /// Compare-and-swap. Returns the new version.
    pub fn write(
        &self,
        resource_id: &str,
        value: V,
        expected: ExpectedVersion,
        writer: &str,
    ) -> CoreResult<u64> {
        let mut slots = self.write_slots()?;
        self.write_locked(&mut slots, resource_id, value, expected, writer)
    }

    fn write_locked(
        &self,
        slots: &mut HashMap<String, Slot<V>>,
        resource_id: &str,
        value: V,
        expected: ExpectedVersion,
        writer: &str,
    ) -> CoreResult<u64> {
        let actual = slots.get(resource_id).map(|s| s.record.version).unwrap_or(0);
        expected
            .check(resource_id, actual)
            .map_err(|e| self.conflict(e))?;

        let version = actual + 1;
        let record = LockRecord {
            resource_id: resource_id.to_string(),
            version,
            last_writer: writer.to_string(),
            updated_at: self.clock.now(),
        };
        slots.insert(resource_id.to_string(), Slot { value, record });
        debug!(resource_id, version, writer, "versioned write");
        Ok(version)
    }

    /// Insert a resource that must not exist yet. Its version becomes 1.
    pub fn create(&self, resource_id: &str, value: V, writer: &str) -> CoreResult<u64> {
        self.write(resource_id, value, ExpectedVersion::Absent, writer)
    }

    /// Remove a resource at `expected` version, returning its last value.
    pub fn delete(&self, resource_id: &str, expected: ExpectedVersion) -> CoreResult<V> {
        let mut slots = self.write_slots()?;
        let actual = slots.get(resource_id).map(|s| s.record.version).unwrap_or(0);
        if actual == 0 {
            return Err(CoreError::not_found(format!("resource '{resource_id}'")));
        }
        expected
            .check(resource_id, actual)
            .map_err(|e| self.conflict(e))?;
        slots
            .remove(resource_id)
            .map(|s| s.value)
            .ok_or_else(|| CoreError::not_found(format!("resource '{resource_id}'")))
    }

    pub fn record(&self, resource_id: &str) -> CoreResult<Option<LockRecord>> {
        Ok(self.read_slots()?.get(resource_id).map(|s| s.record.clone()))
    }

    /// Apply each write independently; one conflict does not roll back the
    /// others.
    pub fn write_batch(&self, items: Vec<BatchWrite<V>>, writer: &str) -> CoreResult<Vec<CoreResult<u64>>> {
        let mut slots = self.write_slots()?;
        Ok(items
            .into_iter()
            .map(|item| {
                self.write_locked(&mut slots, &item.resource_id, item.value, item.expected, writer)
            })
            .collect())
    }

    pub fn len(&self) -> CoreResult<usize> {
        Ok(self.read_slots()?.len())
    }

    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::SystemClock;
    use std::sync::Barrier;
    use std::thread;

    fn manager() -> (Arc<Metrics>, OptimisticLockManager<i64>) {
        let metrics = Arc::new(Metrics::new());
        (
            metrics.clone(),
            OptimisticLockManager::new(SystemClock::shared(), metrics),
        )
    }

    #[test]
    fn versions_start_at_one_and_increment() {
        let (_m, locks) = manager();
        assert_eq!(locks.create("acct", 10, "a").unwrap(), 1);
        assert_eq!(locks.write("acct", 20, ExpectedVersion::Exact(1), "b").unwrap(), 2);

        let read = locks.read("acct").unwrap();
        assert_eq!(read, Versioned { value: 20, version: 2 });
        assert_eq!(locks.record("acct").unwrap().unwrap().last_writer, "b");
    }

    #[test]
    fn stale_write_is_a_conflict() {
        let (metrics, locks) = manager();
        locks.create("acct", 1, "a").unwrap();
        locks.write("acct", 2, ExpectedVersion::Exact(1), "a").unwrap();

        let err = locks
            .write("acct", 3, ExpectedVersion::Exact(1), "b")
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::VersionConflict {
                resource_id: "acct".into(),
                expected: ExpectedVersion::Exact(1),
                actual: 2,
            }
        );
        assert_eq!(locks.read("acct").unwrap().value, 2);
        assert_eq!(metrics.counter(names::VERSION_CONFLICTS), 1);
    }

    #[test]
    fn exactly_one_of_two_concurrent_writers_wins() {
        let (_m, locks) = manager();
        let locks = Arc::new(locks);
        locks.create("shared", 0, "init").unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let locks = locks.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let seen = locks.read("shared").unwrap();
                    barrier.wait();
                    locks.write(
                        "shared",
                        seen.value + 1,
                        ExpectedVersion::Exact(seen.version),
                        &format!("writer-{i}"),
                    )
                })
            })
            .collect();

        let results: Vec<CoreResult<u64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(CoreError::VersionConflict { .. })))
            .count();
        assert_eq!((wins, conflicts), (1, 1));
        assert_eq!(locks.read("shared").unwrap(), Versioned { value: 1, version: 2 });
    }

    #[test]
    fn create_twice_conflicts_and_delete_checks_version() {
        let (_m, locks) = manager();
        locks.create("r", 1, "a").unwrap();
        assert!(matches!(
            locks.create("r", 2, "b"),
            Err(CoreError::VersionConflict { actual: 1, .. })
        ));
        assert!(locks.delete("r", ExpectedVersion::Exact(5)).is_err());
        assert_eq!(locks.delete("r", ExpectedVersion::Exact(1)).unwrap(), 1);
        assert_eq!(locks.version("r").unwrap(), 0);
        assert!(matches!(
            locks.delete("r", ExpectedVersion::Exact(1)),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn batch_results_are_per_item() {
        let (_m, locks) = manager();
        locks.create("a", 1, "x").unwrap();
        let results = locks
            .write_batch(
                vec![
                    BatchWrite {
                        resource_id: "a".into(),
                        value: 2,
                        expected: ExpectedVersion::Exact(1),
                    },
                    BatchWrite {
                        resource_id: "b".into(),
                        value: 9,
                        expected: ExpectedVersion::Exact(3),
                    },
                    BatchWrite {
                        resource_id: "c".into(),
                        value: 7,
                        expected: ExpectedVersion::Absent,
                    },
                ],
                "batch",
            )
            .unwrap();

        assert_eq!(results[0], Ok(2));
        assert!(results[1].is_err());
        assert_eq!(results[2], Ok(1));
    }
}
