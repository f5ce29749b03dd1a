//! Optimistic concurrency expectations for versioned records.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// What the writer believes the stored version to be.
///
/// Version `0` means "no record"; the first successful write produces
/// version `1`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "version", rename_all = "snake_case")]
pub enum ExpectedVersion {
    /// The record must not exist yet.
    Absent,
    /// The record must be at exactly this version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Absent => actual == 0,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, resource_id: &str, actual: u64) -> CoreResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(CoreError::VersionConflict {
                resource_id: resource_id.to_string(),
                expected: self,
                actual,
            })
        }
    }

    /// The version a successful write will produce.
    pub fn next(self) -> u64 {
        match self {
            ExpectedVersion::Absent => 1,
            ExpectedVersion::Exact(v) => v + 1,
        }
    }
}

impl From<u64> for ExpectedVersion {
    fn from(version: u64) -> Self {
        if version == 0 {
            ExpectedVersion::Absent
        } else {
            ExpectedVersion::Exact(version)
        }
    }
}
