use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use super::types::WalEntry;

/// WAL storage error.
#[derive(Debug, Error)]
pub enum WalStorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt wal at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
    #[error("unknown wal sequence number {0}")]
    UnknownSequence(u64),
    #[error("wal storage unavailable: {0}")]
    Unavailable(String),
    #[error("wal storage lock poisoned")]
    Poisoned,
}

/// Everything a storage holds: entries in sequence order plus the highest
/// sequence number ever assigned (which survives compaction).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WalSnapshot {
    pub entries: Vec<WalEntry>,
    pub last_sequence: u64,
}

/// Durable backing for the write-ahead log.
///
/// `append` must not return before the entry is durable.
pub trait WalStorage: Send + Sync {
    fn append(&self, entry: &WalEntry) -> Result<(), WalStorageError>;

    fn mark_committed(
        &self,
        sequence_number: u64,
        committed_at: DateTime<Utc>,
        result: Option<&Value>,
    ) -> Result<(), WalStorageError>;

    fn load(&self) -> Result<WalSnapshot, WalStorageError>;

    /// Replace the stored entries with `retain`, keeping `last_sequence`.
    fn compact(&self, retain: &[WalEntry], last_sequence: u64) -> Result<(), WalStorageError>;
}

/// In-memory storage (tests, embedded use).
#[derive(Debug, Default)]
pub struct InMemoryWalStorage {
    inner: Mutex<WalSnapshot>,
}

impl InMemoryWalStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WalStorage for InMemoryWalStorage {
    fn append(&self, entry: &WalEntry) -> Result<(), WalStorageError> {
        let mut inner = self.inner.lock().map_err(|_| WalStorageError::Poisoned)?;
        inner.last_sequence = inner.last_sequence.max(entry.sequence_number);
        inner.entries.push(entry.clone());
        Ok(())
    }

    fn mark_committed(
        &self,
        sequence_number: u64,
        committed_at: DateTime<Utc>,
        result: Option<&Value>,
    ) -> Result<(), WalStorageError> {
        let mut inner = self.inner.lock().map_err(|_| WalStorageError::Poisoned)?;
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.sequence_number == sequence_number)
            .ok_or(WalStorageError::UnknownSequence(sequence_number))?;
        entry.mark_committed(committed_at, result.cloned());
        Ok(())
    }

    fn load(&self) -> Result<WalSnapshot, WalStorageError> {
        Ok(self.inner.lock().map_err(|_| WalStorageError::Poisoned)?.clone())
    }

    fn compact(&self, retain: &[WalEntry], last_sequence: u64) -> Result<(), WalStorageError> {
        let mut inner = self.inner.lock().map_err(|_| WalStorageError::Poisoned)?;
        inner.entries = retain.to_vec();
        inner.last_sequence = inner.last_sequence.max(last_sequence);
        Ok(())
    }
}

/// Storage whose appends can be switched to fail, for fail-closed tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FlakyWalStorage {
    inner: InMemoryWalStorage,
    fail_appends: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FlakyWalStorage {
    pub(crate) fn set_failing(&self, failing: bool) {
        self.fail_appends
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl WalStorage for FlakyWalStorage {
    fn append(&self, entry: &WalEntry) -> Result<(), WalStorageError> {
        if self.fail_appends.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(WalStorageError::Unavailable("disk full".into()));
        }
        self.inner.append(entry)
    }

    fn mark_committed(
        &self,
        sequence_number: u64,
        committed_at: DateTime<Utc>,
        result: Option<&Value>,
    ) -> Result<(), WalStorageError> {
        self.inner.mark_committed(sequence_number, committed_at, result)
    }

    fn load(&self) -> Result<WalSnapshot, WalStorageError> {
        self.inner.load()
    }

    fn compact(&self, retain: &[WalEntry], last_sequence: u64) -> Result<(), WalStorageError> {
        self.inner.compact(retain, last_sequence)
    }
}
