//! Graceful shutdown: stop leasing, drain in-flight work, hand back what
//! does not finish in time, then checkpoint and run hooks.
//!
//! Phases only move forward: `Running -> Draining -> Flushing -> Stopped`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use jobforge_core::{CoreError, CoreResult, LeaseId, SharedClock, TaskId};
use jobforge_observability::{Metrics, names};

use crate::jobs::{Broker, Lease};
use crate::wal::{CheckpointReport, WriteAheadLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    Running,
    Draining,
    Flushing,
    Stopped,
}

impl ShutdownPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ShutdownPhase::Running,
            1 => ShutdownPhase::Draining,
            2 => ShutdownPhase::Flushing,
            _ => ShutdownPhase::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    Sigterm,
    Sigint,
    Manual,
    Error,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ShutdownReason::Sigterm => "sigterm",
            ShutdownReason::Sigint => "sigint",
            ShutdownReason::Manual => "manual",
            ShutdownReason::Error => "error",
        })
    }
}

/// Outcome of the drain phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    /// In-flight tasks that finished within the drain timeout.
    pub drained: usize,
    /// Tasks interrupted and returned to the broker for redelivery.
    pub interrupted: Vec<TaskId>,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    pub drained: usize,
    pub interrupted: Vec<TaskId>,
    pub checkpoint: Option<CheckpointReport>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub errors: Vec<String>,
}

type ShutdownHook = Box<dyn FnOnce() -> Result<(), String> + Send>;

/// Tracks in-flight leases and sequences shutdown.
pub struct ShutdownCoordinator {
    phase: AtomicU8,
    in_flight: Mutex<HashMap<LeaseId, Lease>>,
    idle: Condvar,
    hooks: Mutex<Vec<(String, ShutdownHook)>>,
    started: Mutex<Option<(ShutdownReason, DateTime<Utc>)>>,
    drain_timeout: Duration,
    clock: SharedClock,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("phase", &self.phase())
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}

/// Removes its lease from the in-flight set when dropped.
#[must_use]
pub struct InFlightGuard<'a> {
    coordinator: &'a ShutdownCoordinator,
    lease_id: LeaseId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = match self.coordinator.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        in_flight.remove(&self.lease_id);
        self.coordinator.idle.notify_all();
    }
}

impl ShutdownCoordinator {
    pub fn new(drain_timeout: Duration, clock: SharedClock, metrics: Arc<Metrics>) -> Self {
        Self {
            phase: AtomicU8::new(ShutdownPhase::Running as u8),
            in_flight: Mutex::new(HashMap::new()),
            idle: Condvar::new(),
            hooks: Mutex::new(Vec::new()),
            started: Mutex::new(None),
            drain_timeout,
            clock,
            metrics,
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// True from the moment shutdown begins. Workers stop leasing.
    pub fn is_draining(&self) -> bool {
        self.phase() != ShutdownPhase::Running
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<LeaseId, Lease>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register `lease` as executing until the guard drops.
    pub fn track(&self, lease: &Lease) -> InFlightGuard<'_> {
        self.lock_in_flight().insert(lease.lease_id, lease.clone());
        InFlightGuard {
            coordinator: self,
            lease_id: lease.lease_id,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.lock_in_flight().len()
    }

    /// Run `hook` once during the flush phase, in registration order.
    pub fn register_hook<F>(&self, name: impl Into<String>, hook: F) -> CoreResult<()>
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        self.hooks
            .lock()
            .map_err(|_| CoreError::transient("shutdown hooks poisoned"))?
            .push((name.into(), Box::new(hook)));
        Ok(())
    }

    /// Move to `Draining`. Returns `false` when shutdown had already begun.
    pub fn begin(&self, reason: ShutdownReason) -> bool {
        let began = self
            .phase
            .compare_exchange(
                ShutdownPhase::Running as u8,
                ShutdownPhase::Draining as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if began {
            if let Ok(mut started) = self.started.lock() {
                *started = Some((reason, self.clock.now()));
            }
            info!(reason = %reason, in_flight = self.in_flight(), "shutdown started");
        }
        began
    }

    /// Wait up to the drain timeout for in-flight tasks to finish, then
    /// interrupt the rest and hand them back to `broker` for redelivery.
    pub fn drain(&self, reason: ShutdownReason, broker: &dyn Broker) -> CoreResult<DrainReport> {
        self.begin(reason);
        let started = Instant::now();
        let deadline = started + self.drain_timeout;

        let mut in_flight = self.lock_in_flight();
        let initial = in_flight.len();
        while !in_flight.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            in_flight = match self.idle.wait_timeout(in_flight, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        let remaining: Vec<Lease> = in_flight.values().cloned().collect();
        drop(in_flight);

        let mut report = DrainReport {
            drained: initial.saturating_sub(remaining.len()),
            interrupted: Vec::new(),
            timed_out: !remaining.is_empty(),
        };
        for lease in remaining {
            lease.cancel.cancel();
            match broker.revoke(&lease) {
                Ok(true) => {
                    self.metrics.incr_labeled(names::TASKS_REDELIVERED, "shutdown");
                    warn!(task_id = %lease.task_id, "task interrupted by shutdown, queued for redelivery");
                    report.interrupted.push(lease.task_id);
                }
                Ok(false) => {}
                Err(e) => {
                    error!(task_id = %lease.task_id, error = %e, "failed to hand back interrupted task");
                }
            }
        }

        self.metrics.observe(names::STAGE_DRAIN, started.elapsed());
        info!(
            drained = report.drained,
            interrupted = report.interrupted.len(),
            "drain finished"
        );
        Ok(report)
    }

    /// Checkpoint the WAL, run hooks and move to `Stopped`.
    pub fn finish(&self, drain: DrainReport, wal: &WriteAheadLog) -> ShutdownReport {
        self.phase
            .store(ShutdownPhase::Flushing as u8, Ordering::SeqCst);
        let mut errors = Vec::new();

        let checkpoint = match wal.checkpoint() {
            Ok(report) => Some(report),
            Err(e) => {
                errors.push(format!("wal checkpoint: {e}"));
                None
            }
        };

        let hooks = match self.hooks.lock() {
            Ok(mut hooks) => std::mem::take(&mut *hooks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for (name, hook) in hooks {
            if let Err(e) = hook() {
                warn!(hook = %name, error = %e, "shutdown hook failed");
                errors.push(format!("{name}: {e}"));
            }
        }

        self.phase.store(ShutdownPhase::Stopped as u8, Ordering::SeqCst);
        let completed_at = self.clock.now();
        let (reason, started_at) = self
            .started
            .lock()
            .ok()
            .and_then(|s| *s)
            .unwrap_or((ShutdownReason::Manual, completed_at));

        info!(
            reason = %reason,
            drained = drain.drained,
            interrupted = drain.interrupted.len(),
            errors = errors.len(),
            "shutdown complete"
        );
        ShutdownReport {
            reason,
            drained: drain.drained,
            interrupted: drain.interrupted,
            checkpoint,
            started_at,
            completed_at,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryBroker, Task, TaskPayload, TaskState};
    use crate::wal::InMemoryWalStorage;
    use jobforge_core::{Priority, SystemClock, WorkerId};
    use std::thread;

    fn coordinator(drain: Duration) -> ShutdownCoordinator {
        ShutdownCoordinator::new(drain, SystemClock::shared(), Arc::new(Metrics::new()))
    }

    fn broker() -> InMemoryBroker {
        InMemoryBroker::new(
            SystemClock::shared(),
            Duration::from_secs(60),
            Arc::new(Metrics::new()),
        )
    }

    fn task() -> Task {
        Task::new("t", TaskPayload::default(), Priority::default())
    }

    #[test]
    fn phases_only_move_forward() {
        let c = coordinator(Duration::ZERO);
        assert_eq!(c.phase(), ShutdownPhase::Running);
        assert!(c.begin(ShutdownReason::Sigterm));
        assert!(!c.begin(ShutdownReason::Sigint));
        assert!(c.is_draining());

        let wal = WriteAheadLog::open(
            Arc::new(InMemoryWalStorage::new()),
            SystemClock::shared(),
            Arc::new(Metrics::new()),
            Duration::from_secs(60),
        )
        .unwrap();
        let report = c.finish(DrainReport::default(), &wal);
        assert_eq!(report.reason, ShutdownReason::Sigterm);
        assert_eq!(c.phase(), ShutdownPhase::Stopped);
    }

    #[test]
    fn drain_waits_for_tasks_that_finish_in_time() {
        let c = Arc::new(coordinator(Duration::from_secs(2)));
        let b = broker();
        b.enqueue(task()).unwrap();
        let lease = b.dequeue(WorkerId::new(), Duration::ZERO).unwrap().unwrap();

        let worker = {
            let c = c.clone();
            thread::spawn(move || {
                let _guard = c.track(&lease);
                thread::sleep(Duration::from_millis(50));
            })
        };
        // Let the worker register before draining.
        while c.in_flight() == 0 && !worker.is_finished() {
            thread::yield_now();
        }

        let report = c.drain(ShutdownReason::Manual, &b).unwrap();
        worker.join().unwrap();
        assert_eq!(report.drained, 1);
        assert!(report.interrupted.is_empty());
        assert!(!report.timed_out);
    }

    #[test]
    fn stragglers_are_cancelled_and_handed_back() {
        let c = coordinator(Duration::from_millis(20));
        let b = broker();
        let id = b.enqueue(task()).unwrap();
        let lease = b.dequeue(WorkerId::new(), Duration::ZERO).unwrap().unwrap();
        let _guard = c.track(&lease);

        let report = c.drain(ShutdownReason::Sigterm, &b).unwrap();
        assert_eq!(report.interrupted, vec![id]);
        assert!(report.timed_out);
        assert!(lease.cancel.is_cancelled());
        assert_eq!(b.get(id).unwrap().unwrap().state, TaskState::Queued);
        assert!(!b.holds(&lease).unwrap());
    }

    #[test]
    fn hook_failures_are_reported_not_fatal() {
        let c = coordinator(Duration::ZERO);
        c.register_hook("flush", || Ok(())).unwrap();
        c.register_hook("close", || Err("socket busy".to_string()))
            .unwrap();
        let wal = WriteAheadLog::open(
            Arc::new(InMemoryWalStorage::new()),
            SystemClock::shared(),
            Arc::new(Metrics::new()),
            Duration::from_secs(60),
        )
        .unwrap();

        let report = c.finish(DrainReport::default(), &wal);
        assert_eq!(report.errors, vec!["close: socket busy".to_string()]);
        assert!(report.checkpoint.is_some());
    }
}
