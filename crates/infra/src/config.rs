//! Runtime configuration.
//!
//! Defaults suit a single-process deployment; every field can be overridden
//! with a `with_*` builder or a `JOBFORGE_*` environment variable.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::RetryPolicy;

pub const ENV_PREFIX: &str = "JOBFORGE_";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl From<ConfigError> for jobforge_core::CoreError {
    fn from(err: ConfigError) -> Self {
        jobforge_core::CoreError::validation(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
    pub workers: usize,
    /// Longest a worker blocks waiting for work.
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    /// How long the broker keeps a finished task's record.
    pub finished_retention: Duration,
    /// Per-task execution limit when the handler sets none.
    pub task_timeout: Duration,
    pub drain_timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// How long a completed idempotency result is served to duplicates.
    pub idempotency_ttl: Duration,
    /// How long an unfinished idempotency claim blocks duplicates.
    pub idempotency_in_progress_ttl: Duration,
    /// Committed WAL entries younger than this survive a checkpoint.
    pub wal_retention: Duration,
    /// In-memory WAL when unset.
    pub wal_path: Option<PathBuf>,
    /// In-memory dead-letter store when unset.
    pub dead_letter_path: Option<PathBuf>,
    pub dead_letter_page_size: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(100),
            lease_duration: Duration::from_secs(300),
            finished_retention: Duration::from_secs(3600),
            task_timeout: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            idempotency_ttl: Duration::from_secs(3600),
            idempotency_in_progress_ttl: Duration::from_secs(600),
            wal_retention: Duration::from_secs(24 * 3600),
            wal_path: None,
            dead_letter_path: None,
            dead_letter_page_size: 50,
        }
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key: format!("{ENV_PREFIX}{key}"),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

impl CoreConfig {
    /// Defaults overridden by `JOBFORGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit source; `lookup`
    /// receives the key without the prefix.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("WORKERS") {
            config.workers = parse::<usize>("WORKERS", &v)?.max(1);
        }
        if let Some(v) = get("POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(parse("POLL_INTERVAL_MS", &v)?);
        }
        if let Some(v) = get("LEASE_SECS") {
            config.lease_duration = Duration::from_secs(parse("LEASE_SECS", &v)?);
        }
        if let Some(v) = get("FINISHED_RETENTION_SECS") {
            config.finished_retention = Duration::from_secs(parse("FINISHED_RETENTION_SECS", &v)?);
        }
        if let Some(v) = get("TASK_TIMEOUT_SECS") {
            config.task_timeout = Duration::from_secs(parse("TASK_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("DRAIN_TIMEOUT_SECS") {
            config.drain_timeout = Duration::from_secs(parse("DRAIN_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("RETRY_BASE_SECS") {
            config.retry_policy.base_delay = Duration::from_secs(parse("RETRY_BASE_SECS", &v)?);
        }
        if let Some(v) = get("RETRY_MAX_DELAY_SECS") {
            config.retry_policy.max_delay = Duration::from_secs(parse("RETRY_MAX_DELAY_SECS", &v)?);
        }
        if let Some(v) = get("RETRY_FACTOR") {
            config.retry_policy.factor = parse("RETRY_FACTOR", &v)?;
        }
        if let Some(v) = get("MAX_RETRIES") {
            config.retry_policy.max_retries = parse("MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("IDEMPOTENCY_TTL_SECS") {
            config.idempotency_ttl = Duration::from_secs(parse("IDEMPOTENCY_TTL_SECS", &v)?);
        }
        if let Some(v) = get("IDEMPOTENCY_IN_PROGRESS_TTL_SECS") {
            config.idempotency_in_progress_ttl =
                Duration::from_secs(parse("IDEMPOTENCY_IN_PROGRESS_TTL_SECS", &v)?);
        }
        if let Some(v) = get("WAL_RETENTION_SECS") {
            config.wal_retention = Duration::from_secs(parse("WAL_RETENTION_SECS", &v)?);
        }
        if let Some(v) = get("WAL_PATH") {
            config.wal_path = Some(PathBuf::from(v.trim()));
        }
        if let Some(v) = get("DEAD_LETTER_PATH") {
            config.dead_letter_path = Some(PathBuf::from(v.trim()));
        }
        if let Some(v) = get("DEAD_LETTER_PAGE_SIZE") {
            config.dead_letter_page_size = parse::<usize>("DEAD_LETTER_PAGE_SIZE", &v)?.max(1);
        }
        Ok(config)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_finished_retention(mut self, retention: Duration) -> Self {
        self.finished_retention = retention;
        self
    }

    pub fn with_task_timeout(mut self, task_timeout: Duration) -> Self {
        self.task_timeout = task_timeout;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    pub fn with_idempotency_in_progress_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_in_progress_ttl = ttl;
        self
    }

    pub fn with_wal_retention(mut self, retention: Duration) -> Self {
        self.wal_retention = retention;
        self
    }

    pub fn with_wal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.wal_path = Some(path.into());
        self
    }

    pub fn with_dead_letter_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dead_letter_path = Some(path.into());
        self
    }

    pub fn with_dead_letter_page_size(mut self, page_size: usize) -> Self {
        self.dead_letter_page_size = page_size.max(1);
        self
    }
}
