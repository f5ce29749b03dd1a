//! Dead-letter storage and routing.
//!
//! Terminally failed tasks land here, in a store separate from the priority
//! bands. Entries are never deleted or retried automatically; an operator
//! lists them and resubmits explicitly.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use jobforge_core::{CoreError, CoreResult, Priority, SharedClock, TaskId};
use jobforge_events::{EventBus, InMemoryEventBus, LifecycleEvent, LifecycleEventKind};
use jobforge_observability::{Metrics, names};

use super::types::{Task, TaskPayload};

const MAX_SUMMARY_LEN: usize = 2_000;

/// Fixed status marker of a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeadLetterStatus {
    #[default]
    #[serde(rename = "dead_letter")]
    DeadLetter,
}

/// A terminally failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task_id: TaskId,
    pub task_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub exception_summary: String,
    pub retries: u32,
    pub max_retries: u32,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub status: DeadLetterStatus,
}

impl DeadLetterEntry {
    pub fn from_task(task: &Task, exception: &str, at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id,
            task_name: task.name.clone(),
            args: task.payload.args.clone(),
            kwargs: task.payload.kwargs.clone(),
            exception_summary: summarize(exception),
            retries: task.retry_count,
            max_retries: task.max_retries,
            priority: task.priority,
            timestamp: at,
            status: DeadLetterStatus::DeadLetter,
        }
    }

    /// A brand-new task carrying this entry's name, payload and priority.
    pub fn to_new_task(&self, max_retries: u32) -> Task {
        Task::new(
            self.task_name.clone(),
            TaskPayload::new(self.args.clone(), self.kwargs.clone()),
            self.priority,
        )
        .with_max_retries(max_retries)
    }
}

fn summarize(exception: &str) -> String {
    let trimmed = exception.trim();
    if trimmed.chars().count() <= MAX_SUMMARY_LEN {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX_SUMMARY_LEN).collect();
    out.push_str("...");
    out
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// 1-based.
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

impl<T> Page<T> {
    pub fn has_next(&self) -> bool {
        self.page.saturating_mul(self.page_size) < self.total
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterStoreError {
    #[error("dead-letter entry already exists: {0}")]
    AlreadyExists(TaskId),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt dead-letter file: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("dead-letter store lock poisoned")]
    Poisoned,
}

impl From<DeadLetterStoreError> for CoreError {
    fn from(err: DeadLetterStoreError) -> Self {
        match err {
            DeadLetterStoreError::AlreadyExists(_) => CoreError::validation(err.to_string()),
            other => CoreError::durability(other.to_string()),
        }
    }
}

/// Dead-letter persistence. Entries keep insertion order.
pub trait DeadLetterStore: Send + Sync {
    fn insert(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterStoreError>;
    fn get(&self, task_id: TaskId) -> Result<Option<DeadLetterEntry>, DeadLetterStoreError>;
    fn list(&self, offset: usize, limit: usize) -> Result<Vec<DeadLetterEntry>, DeadLetterStoreError>;
    fn count(&self) -> Result<usize, DeadLetterStoreError>;
    fn remove(&self, task_id: TaskId) -> Result<Option<DeadLetterEntry>, DeadLetterStoreError>;
}

impl<S: DeadLetterStore + ?Sized> DeadLetterStore for Arc<S> {
    fn insert(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterStoreError> {
        (**self).insert(entry)
    }

    fn get(&self, task_id: TaskId) -> Result<Option<DeadLetterEntry>, DeadLetterStoreError> {
        (**self).get(task_id)
    }

    fn list(&self, offset: usize, limit: usize) -> Result<Vec<DeadLetterEntry>, DeadLetterStoreError> {
        (**self).list(offset, limit)
    }

    fn count(&self) -> Result<usize, DeadLetterStoreError> {
        (**self).count()
    }

    fn remove(&self, task_id: TaskId) -> Result<Option<DeadLetterEntry>, DeadLetterStoreError> {
        (**self).remove(task_id)
    }
}

/// In-memory dead-letter store.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    entries: RwLock<Vec<DeadLetterEntry>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn insert_unique(
    entries: &mut Vec<DeadLetterEntry>,
    entry: DeadLetterEntry,
) -> Result<(), DeadLetterStoreError> {
    if entries.iter().any(|e| e.task_id == entry.task_id) {
        return Err(DeadLetterStoreError::AlreadyExists(entry.task_id));
    }
    entries.push(entry);
    Ok(())
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn insert(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterStoreError> {
        let mut entries = self.entries.write().map_err(|_| DeadLetterStoreError::Poisoned)?;
        insert_unique(&mut entries, entry)
    }

    fn get(&self, task_id: TaskId) -> Result<Option<DeadLetterEntry>, DeadLetterStoreError> {
        let entries = self.entries.read().map_err(|_| DeadLetterStoreError::Poisoned)?;
        Ok(entries.iter().find(|e| e.task_id == task_id).cloned())
    }

    fn list(&self, offset: usize, limit: usize) -> Result<Vec<DeadLetterEntry>, DeadLetterStoreError> {
        let entries = self.entries.read().map_err(|_| DeadLetterStoreError::Poisoned)?;
        Ok(entries.iter().skip(offset).take(limit).cloned().collect())
    }

    fn count(&self) -> Result<usize, DeadLetterStoreError> {
        Ok(self.entries.read().map_err(|_| DeadLetterStoreError::Poisoned)?.len())
    }

    fn remove(&self, task_id: TaskId) -> Result<Option<DeadLetterEntry>, DeadLetterStoreError> {
        let mut entries = self.entries.write().map_err(|_| DeadLetterStoreError::Poisoned)?;
        let idx = entries.iter().position(|e| e.task_id == task_id);
        Ok(idx.map(|i| entries.remove(i)))
    }
}

/// Dead-letter store persisted as one JSON document.
///
/// Every change rewrites the file through a temporary sibling and a rename,
/// so a crash leaves either the old or the new content.
#[derive(Debug)]
pub struct FileDeadLetterStore {
    path: PathBuf,
    entries: RwLock<Vec<DeadLetterEntry>>,
}

impl FileDeadLetterStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeadLetterStoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let raw = fs::read(&path)?;
            if raw.is_empty() {
                Vec::new()
            } else {
                serde_json::from_slice(&raw)?
            }
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &[DeadLetterEntry]) -> Result<(), DeadLetterStoreError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut file, entries)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl DeadLetterStore for FileDeadLetterStore {
    fn insert(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterStoreError> {
        let mut entries = self.entries.write().map_err(|_| DeadLetterStoreError::Poisoned)?;
        let mut next = entries.clone();
        insert_unique(&mut next, entry)?;
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }

    fn get(&self, task_id: TaskId) -> Result<Option<DeadLetterEntry>, DeadLetterStoreError> {
        let entries = self.entries.read().map_err(|_| DeadLetterStoreError::Poisoned)?;
        Ok(entries.iter().find(|e| e.task_id == task_id).cloned())
    }

    fn list(&self, offset: usize, limit: usize) -> Result<Vec<DeadLetterEntry>, DeadLetterStoreError> {
        let entries = self.entries.read().map_err(|_| DeadLetterStoreError::Poisoned)?;
        Ok(entries.iter().skip(offset).take(limit).cloned().collect())
    }

    fn count(&self) -> Result<usize, DeadLetterStoreError> {
        Ok(self.entries.read().map_err(|_| DeadLetterStoreError::Poisoned)?.len())
    }

    fn remove(&self, task_id: TaskId) -> Result<Option<DeadLetterEntry>, DeadLetterStoreError> {
        let mut entries = self.entries.write().map_err(|_| DeadLetterStoreError::Poisoned)?;
        let Some(idx) = entries.iter().position(|e| e.task_id == task_id) else {
            return Ok(None);
        };
        let mut next = entries.clone();
        let removed = next.remove(idx);
        self.persist(&next)?;
        *entries = next;
        Ok(Some(removed))
    }
}

/// Routes terminally failed tasks into the dead-letter store and exposes
/// them for inspection and manual retry.
pub struct DeadLetterRouter {
    store: Arc<dyn DeadLetterStore>,
    page_size: usize,
    clock: SharedClock,
    events: Arc<InMemoryEventBus<LifecycleEvent>>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for DeadLetterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterRouter")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl DeadLetterRouter {
    pub fn new(
        store: Arc<dyn DeadLetterStore>,
        page_size: usize,
        clock: SharedClock,
        events: Arc<InMemoryEventBus<LifecycleEvent>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            clock,
            events,
            metrics,
        }
    }

    /// Persist a dead-letter entry for `task` and announce `failed_terminal`.
    pub fn route(&self, task: &Task, exception: &str) -> CoreResult<DeadLetterEntry> {
        let entry = DeadLetterEntry::from_task(task, exception, self.clock.now());
        match self.store.insert(entry.clone()) {
            Ok(()) => {}
            // Already parked (e.g. replayed after a crash); keep the first entry.
            Err(DeadLetterStoreError::AlreadyExists(_)) => {
                return self
                    .store
                    .get(task.id)?
                    .ok_or_else(|| CoreError::not_found(format!("dead letter {}", task.id)));
            }
            Err(e) => {
                self.metrics
                    .incr_labeled(names::ERRORS, jobforge_core::ErrorKind::DurabilityFailure.as_str());
                return Err(e.into());
            }
        }

        self.metrics.incr(names::TASKS_DEAD_LETTERED);
        warn!(
            task_id = %task.id,
            task_name = %task.name,
            retries = task.retry_count,
            error = %entry.exception_summary,
            "task dead-lettered"
        );

        let event = LifecycleEvent::new(
            task.id,
            task.name.clone(),
            entry.timestamp,
            LifecycleEventKind::FailedTerminal {
                attempts: task.attempt(),
                error: entry.exception_summary.clone(),
            },
        );
        if let Err(e) = self.events.publish(event) {
            warn!(task_id = %task.id, error = ?e, "failed to publish lifecycle event");
        }

        Ok(entry)
    }

    /// Page `page` (1-based) of dead-lettered tasks, oldest first.
    pub fn list(&self, page: usize) -> CoreResult<Page<DeadLetterEntry>> {
        let page = page.max(1);
        let offset = (page - 1).saturating_mul(self.page_size);
        Ok(Page {
            items: self.store.list(offset, self.page_size)?,
            page,
            page_size: self.page_size,
            total: self.store.count()?,
        })
    }

    pub fn get(&self, task_id: TaskId) -> CoreResult<Option<DeadLetterEntry>> {
        Ok(self.store.get(task_id)?)
    }

    pub fn count(&self) -> CoreResult<usize> {
        Ok(self.store.count()?)
    }

    /// Manually resubmit `entry` as a brand-new task (new id, zero retries).
    ///
    /// `resubmit` performs the actual submission; the entry is removed only
    /// after it succeeds.
    pub fn retry<F>(&self, entry: &DeadLetterEntry, max_retries: u32, resubmit: F) -> CoreResult<TaskId>
    where
        F: FnOnce(Task) -> CoreResult<TaskId>,
    {
        if self.store.get(entry.task_id)?.is_none() {
            return Err(CoreError::not_found(format!("dead letter {}", entry.task_id)));
        }

        let task = entry.to_new_task(max_retries);
        let new_id = resubmit(task)?;
        self.store.remove(entry.task_id)?;

        info!(
            dead_task_id = %entry.task_id,
            new_task_id = %new_id,
            task_name = %entry.task_name,
            "dead letter resubmitted"
        );
        Ok(new_id)
    }
}
