//! Append-only JSON-lines WAL file.
//!
//! Each line is one operation: an appended entry, a commit marker, or the
//! sequence high-water mark written at compaction. Appends are followed by
//! `sync_data`. A torn final line (crash mid-write) is ignored on load.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::storage::{WalSnapshot, WalStorage, WalStorageError};
use super::types::WalEntry;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum WalLine {
    Append {
        entry: WalEntry,
    },
    Commit {
        sequence_number: u64,
        committed_at: DateTime<Utc>,
        #[serde(default)]
        result: Option<Value>,
    },
    Mark {
        last_sequence: u64,
    },
}

#[derive(Debug)]
pub struct FileWalStorage {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileWalStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalStorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let file = Self::open_append(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_append(path: &Path) -> Result<File, WalStorageError> {
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }

    fn write_line(&self, line: &WalLine) -> Result<(), WalStorageError> {
        let mut buf = serde_json::to_vec(line).map_err(|e| WalStorageError::Corrupt {
            line: 0,
            reason: e.to_string(),
        })?;
        buf.push(b'\n');

        let mut file = self.file.lock().map_err(|_| WalStorageError::Poisoned)?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }
}

impl WalStorage for FileWalStorage {
    fn append(&self, entry: &WalEntry) -> Result<(), WalStorageError> {
        self.write_line(&WalLine::Append {
            entry: entry.clone(),
        })
    }

    fn mark_committed(
        &self,
        sequence_number: u64,
        committed_at: DateTime<Utc>,
        result: Option<&Value>,
    ) -> Result<(), WalStorageError> {
        self.write_line(&WalLine::Commit {
            sequence_number,
            committed_at,
            result: result.cloned(),
        })
    }

    fn load(&self) -> Result<WalSnapshot, WalStorageError> {
        let _guard = self.file.lock().map_err(|_| WalStorageError::Poisoned)?;
        let reader = BufReader::new(File::open(&self.path)?);
        let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
        let last_non_empty = lines.iter().rposition(|l| !l.trim().is_empty());

        let mut snapshot = WalSnapshot::default();
        let mut offset = 0u64;
        for (idx, raw) in lines.iter().enumerate() {
            let line_start = offset;
            offset += raw.len() as u64 + 1;
            if raw.trim().is_empty() {
                continue;
            }
            let line: WalLine = match serde_json::from_str(raw) {
                Ok(line) => line,
                Err(e) if Some(idx) == last_non_empty => {
                    warn!(path = %self.path.display(), line = idx + 1, error = %e, "truncating torn wal tail");
                    // Later appends must start on a fresh line.
                    OpenOptions::new().write(true).open(&self.path)?.set_len(line_start)?;
                    break;
                }
                Err(e) => {
                    return Err(WalStorageError::Corrupt {
                        line: idx + 1,
                        reason: e.to_string(),
                    });
                }
            };

            match line {
                WalLine::Append { entry } => {
                    snapshot.last_sequence = snapshot.last_sequence.max(entry.sequence_number);
                    snapshot.entries.push(entry);
                }
                WalLine::Commit {
                    sequence_number,
                    committed_at,
                    result,
                } => {
                    if let Some(entry) = snapshot
                        .entries
                        .iter_mut()
                        .find(|e| e.sequence_number == sequence_number)
                    {
                        entry.mark_committed(committed_at, result);
                    }
                }
                WalLine::Mark { last_sequence } => {
                    snapshot.last_sequence = snapshot.last_sequence.max(last_sequence);
                }
            }
        }

        snapshot.entries.sort_by_key(|e| e.sequence_number);
        Ok(snapshot)
    }

    fn compact(&self, retain: &[WalEntry], last_sequence: u64) -> Result<(), WalStorageError> {
        let mut file = self.file.lock().map_err(|_| WalStorageError::Poisoned)?;
        let tmp = self.path.with_extension("compact");
        {
            let mut out = File::create(&tmp)?;
            let mut write = |line: &WalLine| -> Result<(), WalStorageError> {
                let mut buf = serde_json::to_vec(line).map_err(|e| WalStorageError::Corrupt {
                    line: 0,
                    reason: e.to_string(),
                })?;
                buf.push(b'\n');
                out.write_all(&buf)?;
                Ok(())
            };
            write(&WalLine::Mark { last_sequence })?;
            for entry in retain {
                write(&WalLine::Append {
                    entry: entry.clone(),
                })?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        *file = Self::open_append(&self.path)?;
        Ok(())
    }
}
