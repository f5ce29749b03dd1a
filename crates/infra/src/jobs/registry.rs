//! Name-to-handler registry, filled at startup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::context::CoreContext;

use super::types::{CancellationToken, RetryPolicy, Task, TaskOutcome};

/// Everything a handler gets for one execution attempt.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub task: Task,
    /// 1 for the first execution.
    pub attempt: u32,
    cancel: CancellationToken,
    context: Arc<CoreContext>,
}

impl TaskInvocation {
    pub fn new(task: Task, cancel: CancellationToken, context: Arc<CoreContext>) -> Self {
        Self {
            attempt: task.attempt(),
            task,
            cancel,
            context,
        }
    }

    /// Handlers doing long work must poll this and return
    /// [`TaskOutcome::Interrupted`] once it turns true.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Shared services (lock manager, idempotency, sagas, WAL).
    pub fn context(&self) -> &Arc<CoreContext> {
        &self.context
    }

    /// Sleep in small slices, stopping early on cancellation. Returns
    /// `false` if cancelled.
    pub fn sleep_cancellable(&self, total: Duration) -> bool {
        let slice = Duration::from_millis(10);
        let deadline = std::time::Instant::now() + total;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return true;
            }
            std::thread::sleep(remaining.min(slice));
        }
    }
}

/// Task handler function type.
pub type TaskHandler = Arc<dyn Fn(&TaskInvocation) -> TaskOutcome + Send + Sync>;

/// Per-name overrides.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    pub retry_policy: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
}

impl HandlerOptions {
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Clone)]
pub struct Registration {
    pub pattern: String,
    pub handler: TaskHandler,
    pub options: HandlerOptions,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("pattern", &self.pattern)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("handler already registered for '{0}'")]
    Duplicate(String),
    #[error("invalid handler pattern '{0}'")]
    InvalidPattern(String),
}

/// Handler registry.
///
/// Lookup order: exact name, then the longest matching `prefix.*`
/// pattern, then the `*` wildcard.
#[derive(Debug, Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, pattern: impl Into<String>, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(&TaskInvocation) -> TaskOutcome + Send + Sync + 'static,
    {
        self.register_with(pattern, HandlerOptions::default(), handler)
    }

    pub fn register_with<F>(
        &mut self,
        pattern: impl Into<String>,
        options: HandlerOptions,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&TaskInvocation) -> TaskOutcome + Send + Sync + 'static,
    {
        let pattern = pattern.into();
        if pattern.is_empty() || (pattern.contains('*') && pattern != "*" && !pattern.ends_with(".*")) {
            return Err(RegistryError::InvalidPattern(pattern));
        }
        if self.handlers.contains_key(&pattern) {
            return Err(RegistryError::Duplicate(pattern));
        }
        self.handlers.insert(
            pattern.clone(),
            Registration {
                pattern,
                handler: Arc::new(handler),
                options,
            },
        );
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<&Registration> {
        if let Some(r) = self.handlers.get(name) {
            return Some(r);
        }

        // e.g. "report.*" matches "report.monthly"
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, r)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = name.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), r))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, r)| r);
        if category.is_some() {
            return category;
        }

        self.handlers.get("*")
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Retry policy for `name`, falling back to `default`.
    pub fn retry_policy<'a>(&'a self, name: &str, default: &'a RetryPolicy) -> &'a RetryPolicy {
        self.resolve(name)
            .and_then(|r| r.options.retry_policy.as_ref())
            .unwrap_or(default)
    }

    pub fn timeout(&self, name: &str) -> Option<Duration> {
        self.resolve(name).and_then(|r| r.options.timeout)
    }

    pub fn patterns(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(_: &TaskInvocation) -> TaskOutcome {
        TaskOutcome::Success(serde_json::Value::Null)
    }

    #[test]
    fn exact_beats_category_beats_wildcard() {
        let mut r = HandlerRegistry::new();
        r.register("*", ok).unwrap();
        r.register("report.*", ok).unwrap();
        r.register("report.monthly", ok).unwrap();

        assert_eq!(r.resolve("report.monthly").unwrap().pattern, "report.monthly");
        assert_eq!(r.resolve("report.weekly").unwrap().pattern, "report.*");
        assert_eq!(r.resolve("email.send").unwrap().pattern, "*");
    }

    #[test]
    fn longest_category_wins() {
        let mut r = HandlerRegistry::new();
        r.register("a.*", ok).unwrap();
        r.register("a.b.*", ok).unwrap();

        assert_eq!(r.resolve("a.b.c").unwrap().pattern, "a.b.*");
        assert_eq!(r.resolve("a.x").unwrap().pattern, "a.*");
        assert!(r.resolve("ab.c").is_none());
    }

    #[test]
    fn duplicates_and_bad_patterns_are_rejected() {
        let mut r = HandlerRegistry::new();
        r.register("x", ok).unwrap();
        assert_eq!(r.register("x", ok), Err(RegistryError::Duplicate("x".into())));
        assert!(matches!(r.register("x*y", ok), Err(RegistryError::InvalidPattern(_))));
    }

    #[test]
    fn per_name_retry_policy_overrides_default() {
        let mut r = HandlerRegistry::new();
        r.register_with(
            "fragile",
            HandlerOptions::default().with_retry_policy(RetryPolicy::no_retry()),
            ok,
        )
        .unwrap();

        let default = RetryPolicy::default();
        assert_eq!(r.retry_policy("fragile", &default).max_retries, 0);
        assert_eq!(r.retry_policy("other", &default).max_retries, 3);
    }
}
