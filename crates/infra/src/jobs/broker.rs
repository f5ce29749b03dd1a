//! Lease-based task broker.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use jobforge_core::{CoreError, LeaseId, SharedClock, TaskId, WorkerId};
use jobforge_observability::{Metrics, names};

use super::scheduler::PriorityScheduler;
use super::types::{CancellationToken, Task, TaskState};

/// Exclusive, time-bounded right to execute one task.
///
/// A lease refers to its task by id only; the task record stays in the
/// broker.
#[derive(Debug, Clone)]
pub struct Lease {
    pub lease_id: LeaseId,
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Raised on cancellation or shutdown interruption; handlers poll it.
    pub cancel: CancellationToken,
}

/// How a worker gives a task back.
#[derive(Debug, Clone, PartialEq)]
pub enum NackAction {
    /// Back to the head of its band, no retry consumed.
    Requeue,
    /// Consume a retry and hide the task until `visible_at`.
    Retry {
        error: String,
        visible_at: DateTime<Utc>,
    },
    /// Retries exhausted.
    DeadLetter { error: String },
    /// The handler stopped because the task was cancelled.
    Cancel,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed from its band before any worker leased it.
    Cancelled,
    /// Executing; the handler's cancellation flag has been raised.
    Signalled,
    /// Already in a terminal state.
    AlreadyFinished,
}

/// Broker error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker is closed")]
    Closed,
    #[error("task not found: {0}")]
    UnknownTask(TaskId),
    #[error("lease {lease_id} on task {task_id} is no longer held")]
    LeaseLost { task_id: TaskId, lease_id: LeaseId },
    #[error("worker {0} already holds a lease")]
    PrefetchExceeded(WorkerId),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("broker state lock poisoned")]
    Poisoned,
}

impl From<BrokerError> for CoreError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Closed | BrokerError::Poisoned => CoreError::transient(err.to_string()),
            BrokerError::UnknownTask(id) => CoreError::not_found(format!("task {id}")),
            BrokerError::LeaseLost { .. } | BrokerError::PrefetchExceeded(_) => {
                CoreError::transient(err.to_string())
            }
            BrokerError::InvalidTransition(msg) => CoreError::validation(msg),
        }
    }
}

/// Broker statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BrokerStats {
    pub ready: usize,
    pub delayed: usize,
    pub leased: usize,
    pub ready_by_band: Vec<usize>,
    pub total_tasks: usize,
}

/// Task broker abstraction.
///
/// Implementations provide atomic lease-and-hide: a task handed out by
/// `dequeue` is invisible to every other worker until it is acked, nacked,
/// revoked or its lease expires.
pub trait Broker: Send + Sync {
    /// Add a task to its priority band (or the delayed set when it carries a
    /// future `visible_at`). Enqueueing a known id is a no-op.
    fn enqueue(&self, task: Task) -> Result<TaskId, BrokerError>;

    /// Lease the next ready task, waiting up to `wait` for one to appear.
    /// `Ok(None)` after the wait is normal idle behaviour.
    fn dequeue(&self, worker: WorkerId, wait: Duration) -> Result<Option<Lease>, BrokerError>;

    /// Finish a lease successfully.
    fn ack(&self, lease: &Lease) -> Result<Task, BrokerError>;

    /// Give a leased task back.
    fn nack(&self, lease: &Lease, action: NackAction) -> Result<Task, BrokerError>;

    /// Take a lease away from its holder and put the task back at the head of
    /// its band (shutdown interruption). Returns `false` if the lease was no
    /// longer current.
    fn revoke(&self, lease: &Lease) -> Result<bool, BrokerError>;

    /// Whether `lease` is still the current lease on its task.
    fn holds(&self, lease: &Lease) -> Result<bool, BrokerError>;

    /// Push the expiry of a current lease one lease duration past now.
    /// Returns `false` if the lease was no longer current.
    fn renew(&self, lease: &Lease) -> Result<bool, BrokerError>;

    fn cancel(&self, task_id: TaskId) -> Result<CancelOutcome, BrokerError>;

    /// A task record. Finished records are dropped after a retention window.
    fn get(&self, task_id: TaskId) -> Result<Option<Task>, BrokerError>;

    /// Return tasks whose leases expired to their bands and drop finished
    /// records past their retention.
    fn reap_expired(&self) -> Result<usize, BrokerError>;

    /// Reject further enqueues and wake blocked workers.
    fn close(&self);

    fn stats(&self) -> Result<BrokerStats, BrokerError>;
}

impl<B: Broker + ?Sized> Broker for Arc<B> {
    fn enqueue(&self, task: Task) -> Result<TaskId, BrokerError> {
        (**self).enqueue(task)
    }

    fn dequeue(&self, worker: WorkerId, wait: Duration) -> Result<Option<Lease>, BrokerError> {
        (**self).dequeue(worker, wait)
    }

    fn ack(&self, lease: &Lease) -> Result<Task, BrokerError> {
        (**self).ack(lease)
    }

    fn nack(&self, lease: &Lease, action: NackAction) -> Result<Task, BrokerError> {
        (**self).nack(lease, action)
    }

    fn revoke(&self, lease: &Lease) -> Result<bool, BrokerError> {
        (**self).revoke(lease)
    }

    fn holds(&self, lease: &Lease) -> Result<bool, BrokerError> {
        (**self).holds(lease)
    }

    fn renew(&self, lease: &Lease) -> Result<bool, BrokerError> {
        (**self).renew(lease)
    }

    fn cancel(&self, task_id: TaskId) -> Result<CancelOutcome, BrokerError> {
        (**self).cancel(task_id)
    }

    fn get(&self, task_id: TaskId) -> Result<Option<Task>, BrokerError> {
        (**self).get(task_id)
    }

    fn reap_expired(&self) -> Result<usize, BrokerError> {
        (**self).reap_expired()
    }

    fn close(&self) {
        (**self).close()
    }

    fn stats(&self) -> Result<BrokerStats, BrokerError> {
        (**self).stats()
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    /// Task arena; queues and leases refer into it by id.
    tasks: HashMap<TaskId, Task>,
    scheduler: PriorityScheduler,
    leases: HashMap<TaskId, Lease>,
    by_worker: HashMap<WorkerId, TaskId>,
    /// Terminal tasks in the order they finished.
    finished: VecDeque<(DateTime<Utc>, TaskId)>,
    closed: bool,
}

impl BrokerState {
    fn current_lease(&self, lease: &Lease) -> Result<(), BrokerError> {
        match self.leases.get(&lease.task_id) {
            Some(held) if held.lease_id == lease.lease_id => Ok(()),
            _ => Err(BrokerError::LeaseLost {
                task_id: lease.task_id,
                lease_id: lease.lease_id,
            }),
        }
    }

    fn release(&mut self, task_id: TaskId) -> Option<Lease> {
        let lease = self.leases.remove(&task_id)?;
        self.by_worker.remove(&lease.worker_id);
        Some(lease)
    }

    fn retire(&mut self, task_id: TaskId, at: DateTime<Utc>) {
        self.finished.push_back((at, task_id));
    }

    fn task_mut(&mut self, task_id: TaskId) -> Result<&mut Task, BrokerError> {
        self.tasks
            .get_mut(&task_id)
            .ok_or(BrokerError::UnknownTask(task_id))
    }
}

/// In-memory broker.
///
/// Durability of queued work comes from the write-ahead log: every accepted
/// submission has a pending WAL entry, and replay re-enqueues it after a
/// crash. Finished task records are kept for status queries until
/// `finished_retention` has passed.
#[derive(Debug)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    ready: Condvar,
    clock: SharedClock,
    lease_duration: Duration,
    finished_retention: Duration,
    /// Upper bound on a single condvar wait, so delayed tasks are noticed
    /// even when nobody notifies.
    poll_slice: Duration,
    metrics: Arc<Metrics>,
}

impl InMemoryBroker {
    pub fn new(clock: SharedClock, lease_duration: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            ready: Condvar::new(),
            clock,
            lease_duration,
            finished_retention: Duration::from_secs(3600),
            poll_slice: Duration::from_millis(50),
            metrics,
        }
    }

    pub fn with_finished_retention(mut self, retention: Duration) -> Self {
        self.finished_retention = retention;
        self
    }

    fn lease_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.lease_duration).unwrap_or_else(|_| chrono::Duration::zero())
    }

    fn evict_finished_locked(&self, state: &mut BrokerState, now: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        while let Some(&(at, task_id)) = state.finished.front() {
            let age = (now - at).to_std().unwrap_or(Duration::ZERO);
            if age < self.finished_retention {
                break;
            }
            state.finished.pop_front();
            if state.tasks.get(&task_id).is_some_and(|t| t.state.is_terminal()) {
                state.tasks.remove(&task_id);
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, "finished task records evicted");
        }
        evicted
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        self.state.lock().map_err(|_| BrokerError::Poisoned)
    }

    fn reap_locked(&self, state: &mut BrokerState, now: DateTime<Utc>) -> usize {
        let expired: Vec<TaskId> = state
            .leases
            .values()
            .filter(|l| l.expires_at <= now)
            .map(|l| l.task_id)
            .collect();

        let mut reaped = 0;
        for task_id in expired {
            let Some(lease) = state.release(task_id) else {
                continue;
            };
            lease.cancel.cancel();
            if let Some(task) = state.tasks.get_mut(&task_id) {
                if task.mark_requeued(now).is_ok() {
                    let priority = task.priority;
                    state.scheduler.push_front(task_id, priority);
                    reaped += 1;
                    warn!(task_id = %task_id, worker = %lease.worker_id, "lease expired, task redelivered");
                }
            }
        }
        if reaped > 0 {
            self.metrics.add(names::TASKS_REDELIVERED, "lease_expired", reaped as u64);
        }
        self.evict_finished_locked(state, now);
        reaped
    }

    fn try_lease(
        &self,
        state: &mut BrokerState,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>, BrokerError> {
        self.reap_locked(state, now);

        while let Some((task_id, _priority)) = state.scheduler.pop_next(now) {
            let Some(task) = state.tasks.get_mut(&task_id) else {
                continue;
            };
            if task.mark_executing(now).is_err() {
                // Finished or cancelled while still referenced by a band.
                continue;
            }

            let lease = Lease {
                lease_id: LeaseId::new(),
                task_id,
                worker_id: worker,
                leased_at: now,
                expires_at: self.lease_expiry(now),
                cancel: CancellationToken::new(),
            };
            state.leases.insert(task_id, lease.clone());
            state.by_worker.insert(worker, task_id);
            return Ok(Some(lease));
        }

        Ok(None)
    }
}

impl Broker for InMemoryBroker {
    fn enqueue(&self, mut task: Task) -> Result<TaskId, BrokerError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(BrokerError::Closed);
        }

        let task_id = task.id;
        if state.tasks.contains_key(&task_id) {
            return Ok(task_id);
        }

        let now = self.clock.now();
        if !matches!(task.state, TaskState::Queued | TaskState::Retrying) {
            task.state = TaskState::Queued;
        }
        match task.visible_at {
            Some(at) if at > now => state.scheduler.schedule(task_id, task.priority, at),
            _ => state.scheduler.push_back(task_id, task.priority),
        }
        state.tasks.insert(task_id, task);
        drop(state);

        self.ready.notify_one();
        Ok(task_id)
    }

    fn dequeue(&self, worker: WorkerId, wait: Duration) -> Result<Option<Lease>, BrokerError> {
        let deadline = Instant::now() + wait;
        let mut state = self.lock()?;

        if state.by_worker.contains_key(&worker) {
            return Err(BrokerError::PrefetchExceeded(worker));
        }

        loop {
            if state.closed {
                return Err(BrokerError::Closed);
            }

            self.metrics.incr(names::DEQUEUE_CHECKS);
            let now = self.clock.now();
            if let Some(lease) = self.try_lease(&mut state, worker, now)? {
                self.metrics.incr(names::DEQUEUES);
                debug!(task_id = %lease.task_id, worker = %worker, "task leased");
                return Ok(Some(lease));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let (guard, _) = self
                .ready
                .wait_timeout(state, remaining.min(self.poll_slice))
                .map_err(|_| BrokerError::Poisoned)?;
            state = guard;
        }
    }

    fn ack(&self, lease: &Lease) -> Result<Task, BrokerError> {
        let mut state = self.lock()?;
        state.current_lease(lease)?;
        let now = self.clock.now();

        let task = state.task_mut(lease.task_id)?;
        task.mark_succeeded(lease.leased_at, now)
            .map_err(|e| BrokerError::InvalidTransition(e.to_string()))?;
        let snapshot = task.clone();
        state.release(lease.task_id);
        state.retire(lease.task_id, now);
        Ok(snapshot)
    }

    fn nack(&self, lease: &Lease, action: NackAction) -> Result<Task, BrokerError> {
        let mut state = self.lock()?;
        state.current_lease(lease)?;
        let now = self.clock.now();

        let task = state.task_mut(lease.task_id)?;
        let result = match &action {
            NackAction::Requeue => task.mark_requeued(now),
            NackAction::Retry { error, visible_at } => {
                task.mark_retrying(error.clone(), lease.leased_at, *visible_at, now)
            }
            NackAction::DeadLetter { error } => {
                task.mark_dead_lettered(error.clone(), lease.leased_at, now)
            }
            NackAction::Cancel => task.mark_cancelled(now),
        };
        result.map_err(|e| BrokerError::InvalidTransition(e.to_string()))?;

        let snapshot = task.clone();
        state.release(lease.task_id);
        match action {
            NackAction::Requeue => state.scheduler.push_front(snapshot.id, snapshot.priority),
            NackAction::Retry { visible_at, .. } => {
                state
                    .scheduler
                    .schedule(snapshot.id, snapshot.priority, visible_at)
            }
            NackAction::DeadLetter { .. } | NackAction::Cancel => state.retire(snapshot.id, now),
        }
        drop(state);

        self.ready.notify_one();
        Ok(snapshot)
    }

    fn revoke(&self, lease: &Lease) -> Result<bool, BrokerError> {
        let mut state = self.lock()?;
        if state.current_lease(lease).is_err() {
            return Ok(false);
        }
        let now = self.clock.now();

        lease.cancel.cancel();
        let task = state.task_mut(lease.task_id)?;
        task.mark_requeued(now)
            .map_err(|e| BrokerError::InvalidTransition(e.to_string()))?;
        let priority = task.priority;
        state.release(lease.task_id);
        state.scheduler.push_front(lease.task_id, priority);
        Ok(true)
    }

    fn holds(&self, lease: &Lease) -> Result<bool, BrokerError> {
        Ok(self.lock()?.current_lease(lease).is_ok())
    }

    fn renew(&self, lease: &Lease) -> Result<bool, BrokerError> {
        let mut state = self.lock()?;
        if state.current_lease(lease).is_err() {
            return Ok(false);
        }
        let expires_at = self.lease_expiry(self.clock.now());
        if let Some(held) = state.leases.get_mut(&lease.task_id) {
            held.expires_at = expires_at;
        }
        Ok(true)
    }

    fn cancel(&self, task_id: TaskId) -> Result<CancelOutcome, BrokerError> {
        let mut state = self.lock()?;
        let now = self.clock.now();

        let current = state
            .tasks
            .get(&task_id)
            .map(|t| t.state)
            .ok_or(BrokerError::UnknownTask(task_id))?;

        match current {
            TaskState::Queued | TaskState::Retrying => {
                state.scheduler.remove(task_id);
                let task = state.task_mut(task_id)?;
                task.mark_cancelled(now)
                    .map_err(|e| BrokerError::InvalidTransition(e.to_string()))?;
                state.retire(task_id, now);
                Ok(CancelOutcome::Cancelled)
            }
            TaskState::Executing => {
                if let Some(lease) = state.leases.get(&task_id) {
                    lease.cancel.cancel();
                }
                Ok(CancelOutcome::Signalled)
            }
            _ => Ok(CancelOutcome::AlreadyFinished),
        }
    }

    fn get(&self, task_id: TaskId) -> Result<Option<Task>, BrokerError> {
        Ok(self.lock()?.tasks.get(&task_id).cloned())
    }

    fn reap_expired(&self) -> Result<usize, BrokerError> {
        let mut state = self.lock()?;
        let now = self.clock.now();
        let reaped = self.reap_locked(&mut state, now);
        drop(state);
        if reaped > 0 {
            self.ready.notify_all();
        }
        Ok(reaped)
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.ready.notify_all();
    }

    fn stats(&self) -> Result<BrokerStats, BrokerError> {
        let state = self.lock()?;
        Ok(BrokerStats {
            ready: state.scheduler.ready_len(),
            delayed: state.scheduler.delayed_len(),
            leased: state.leases.len(),
            ready_by_band: state.scheduler.band_lengths().to_vec(),
            total_tasks: state.tasks.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::TaskPayload;
    use jobforge_core::{Clock, ManualClock, Priority};

    fn broker() -> (Arc<ManualClock>, InMemoryBroker) {
        let clock = ManualClock::starting_now();
        let broker = InMemoryBroker::new(
            clock.clone(),
            Duration::from_secs(30),
            Arc::new(Metrics::new()),
        );
        (clock, broker)
    }

    fn task(priority: i64) -> Task {
        Task::new("t", TaskPayload::default(), Priority::new(priority).unwrap())
    }

    #[test]
    fn leased_task_is_invisible_to_other_workers() {
        let (_clock, b) = broker();
        let id = b.enqueue(task(5)).unwrap();

        let lease = b.dequeue(WorkerId::new(), Duration::ZERO).unwrap().unwrap();
        assert_eq!(lease.task_id, id);
        assert!(b.dequeue(WorkerId::new(), Duration::ZERO).unwrap().is_none());
        assert_eq!(b.get(id).unwrap().unwrap().state, TaskState::Executing);
    }

    #[test]
    fn higher_priority_is_dequeued_first() {
        let (_clock, b) = broker();
        let low = b.enqueue(task(2)).unwrap();
        let high = b.enqueue(task(7)).unwrap();

        let w = WorkerId::new();
        let first = b.dequeue(w, Duration::ZERO).unwrap().unwrap();
        assert_eq!(first.task_id, high);
        b.ack(&first).unwrap();
        let second = b.dequeue(w, Duration::ZERO).unwrap().unwrap();
        assert_eq!(second.task_id, low);
    }

    #[test]
    fn prefetch_is_one_lease_per_worker() {
        let (_clock, b) = broker();
        b.enqueue(task(5)).unwrap();
        b.enqueue(task(5)).unwrap();

        let w = WorkerId::new();
        let _lease = b.dequeue(w, Duration::ZERO).unwrap().unwrap();
        assert_eq!(
            b.dequeue(w, Duration::ZERO).unwrap_err(),
            BrokerError::PrefetchExceeded(w)
        );
    }

    #[test]
    fn empty_dequeue_times_out_without_error() {
        let (_clock, b) = broker();
        let started = Instant::now();
        let got = b.dequeue(WorkerId::new(), Duration::from_millis(30)).unwrap();
        assert!(got.is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn expired_lease_is_redelivered() {
        let (clock, b) = broker();
        let id = b.enqueue(task(5)).unwrap();
        let stale = b.dequeue(WorkerId::new(), Duration::ZERO).unwrap().unwrap();

        clock.advance(Duration::from_secs(31));
        let fresh = b.dequeue(WorkerId::new(), Duration::ZERO).unwrap().unwrap();
        assert_eq!(fresh.task_id, id);
        assert_ne!(fresh.lease_id, stale.lease_id);
        assert!(stale.cancel.is_cancelled());

        assert!(matches!(b.ack(&stale), Err(BrokerError::LeaseLost { .. })));
        assert!(b.ack(&fresh).is_ok());
    }

    #[test]
    fn retry_nack_hides_task_until_visible() {
        let (clock, b) = broker();
        let id = b.enqueue(task(5)).unwrap();
        let w = WorkerId::new();
        let lease = b.dequeue(w, Duration::ZERO).unwrap().unwrap();

        let visible_at = clock.now() + chrono::Duration::seconds(60);
        let t = b
            .nack(
                &lease,
                NackAction::Retry {
                    error: "flaky".into(),
                    visible_at,
                },
            )
            .unwrap();
        assert_eq!(t.state, TaskState::Retrying);
        assert_eq!(t.retry_count, 1);

        assert!(b.dequeue(w, Duration::ZERO).unwrap().is_none());
        clock.advance(Duration::from_secs(60));
        assert_eq!(b.dequeue(w, Duration::ZERO).unwrap().unwrap().task_id, id);
    }

    #[test]
    fn queued_task_can_be_cancelled_outright() {
        let (_clock, b) = broker();
        let id = b.enqueue(task(5)).unwrap();

        assert_eq!(b.cancel(id).unwrap(), CancelOutcome::Cancelled);
        assert!(b.dequeue(WorkerId::new(), Duration::ZERO).unwrap().is_none());
        assert_eq!(b.get(id).unwrap().unwrap().state, TaskState::Cancelled);
        assert_eq!(b.cancel(id).unwrap(), CancelOutcome::AlreadyFinished);
    }

    #[test]
    fn executing_task_is_cancelled_cooperatively() {
        let (_clock, b) = broker();
        let id = b.enqueue(task(5)).unwrap();
        let lease = b.dequeue(WorkerId::new(), Duration::ZERO).unwrap().unwrap();

        assert_eq!(b.cancel(id).unwrap(), CancelOutcome::Signalled);
        assert!(lease.cancel.is_cancelled());
        assert_eq!(b.nack(&lease, NackAction::Cancel).unwrap().state, TaskState::Cancelled);
    }

    #[test]
    fn revoked_lease_goes_back_to_the_head_of_its_band() {
        let (_clock, b) = broker();
        let first = b.enqueue(task(5)).unwrap();
        let second = b.enqueue(task(5)).unwrap();
        let w = WorkerId::new();
        let lease = b.dequeue(w, Duration::ZERO).unwrap().unwrap();
        assert_eq!(lease.task_id, first);

        assert!(b.holds(&lease).unwrap());
        assert!(b.revoke(&lease).unwrap());
        assert!(!b.revoke(&lease).unwrap());
        assert!(!b.holds(&lease).unwrap());
        assert!(lease.cancel.is_cancelled());

        let next = b.dequeue(w, Duration::ZERO).unwrap().unwrap();
        assert_eq!(next.task_id, first);
        assert_ne!(next.task_id, second);
    }

    #[test]
    fn closed_broker_fails_fast() {
        let (_clock, b) = broker();
        b.close();
        assert_eq!(b.enqueue(task(5)).unwrap_err(), BrokerError::Closed);
        let core: CoreError = BrokerError::Closed.into();
        assert!(core.is_transient());
    }

    #[test]
    fn renewed_lease_survives_past_its_first_expiry() {
        let (clock, b) = broker();
        let id = b.enqueue(task(5)).unwrap();
        let lease = b.dequeue(WorkerId::new(), Duration::ZERO).unwrap().unwrap();

        clock.advance(Duration::from_secs(20));
        assert!(b.renew(&lease).unwrap());
        clock.advance(Duration::from_secs(20));
        assert_eq!(b.reap_expired().unwrap(), 0);
        assert!(b.holds(&lease).unwrap());

        b.ack(&lease).unwrap();
        assert!(!b.renew(&lease).unwrap());
        assert_eq!(b.get(id).unwrap().unwrap().state, TaskState::Succeeded);
    }

    #[test]
    fn finished_records_are_evicted_after_retention() {
        let clock = ManualClock::starting_now();
        let b = InMemoryBroker::new(clock.clone(), Duration::from_secs(30), Arc::new(Metrics::new()))
            .with_finished_retention(Duration::from_secs(600));
        let done = b.enqueue(task(5)).unwrap();
        let cancelled = b.enqueue(task(5)).unwrap();
        let waiting = b.enqueue(task(1)).unwrap();

        let lease = b.dequeue(WorkerId::new(), Duration::ZERO).unwrap().unwrap();
        assert_eq!(lease.task_id, done);
        b.ack(&lease).unwrap();
        b.cancel(cancelled).unwrap();

        clock.advance(Duration::from_secs(599));
        b.reap_expired().unwrap();
        assert!(b.get(done).unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        b.reap_expired().unwrap();
        assert!(b.get(done).unwrap().is_none());
        assert!(b.get(cancelled).unwrap().is_none());
        assert_eq!(b.get(waiting).unwrap().unwrap().state, TaskState::Queued);
        assert_eq!(b.stats().unwrap().total_tasks, 1);
    }

    #[test]
    fn enqueue_is_idempotent_on_task_id() {
        let (_clock, b) = broker();
        let t = task(5);
        b.enqueue(t.clone()).unwrap();
        b.enqueue(t).unwrap();
        assert_eq!(b.stats().unwrap().ready, 1);
    }
}
