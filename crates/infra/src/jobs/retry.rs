//! Retry scheduling with capped exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use jobforge_core::{CoreResult, SharedClock};
use jobforge_events::{EventBus, InMemoryEventBus, LifecycleEvent, LifecycleEventKind};
use jobforge_observability::{Metrics, names};

use super::broker::{Broker, Lease, NackAction};
use super::dead_letter::{DeadLetterEntry, DeadLetterRouter};
use super::registry::HandlerRegistry;
use super::types::{RetryPolicy, Task};

/// What the controller did with a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Hidden until `visible_at`, then redelivered at its original priority.
    Scheduled {
        attempt: u32,
        delay: Duration,
        visible_at: DateTime<Utc>,
    },
    /// Retries exhausted.
    DeadLettered(DeadLetterEntry),
}

pub struct RetryController {
    default_policy: RetryPolicy,
    registry: Arc<HandlerRegistry>,
    dead_letters: Arc<DeadLetterRouter>,
    events: Arc<InMemoryEventBus<LifecycleEvent>>,
    clock: SharedClock,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for RetryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryController")
            .field("default_policy", &self.default_policy)
            .finish_non_exhaustive()
    }
}

impl RetryController {
    pub fn new(
        default_policy: RetryPolicy,
        registry: Arc<HandlerRegistry>,
        dead_letters: Arc<DeadLetterRouter>,
        events: Arc<InMemoryEventBus<LifecycleEvent>>,
        clock: SharedClock,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            default_policy,
            registry,
            dead_letters,
            events,
            clock,
            metrics,
        }
    }

    /// Policy in force for tasks named `name`.
    pub fn policy_for(&self, name: &str) -> &RetryPolicy {
        self.registry.retry_policy(name, &self.default_policy)
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    /// Handle a failed attempt of the leased `task`.
    ///
    /// While retries remain, the task is nacked with a future visibility
    /// computed from the policy (or `override_delay` when the handler asked
    /// for one). Otherwise it is buried and handed to the dead-letter router.
    pub fn schedule_retry(
        &self,
        broker: &dyn Broker,
        lease: &Lease,
        task: &Task,
        error: &str,
        override_delay: Option<Duration>,
    ) -> CoreResult<RetryDecision> {
        let policy = self.policy_for(&task.name);

        if task.retry_count < task.max_retries {
            let attempt = task.retry_count + 1;
            let delay = override_delay.unwrap_or_else(|| policy.delay_for_attempt(attempt));
            let now = self.clock.now();
            let visible_at =
                now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

            broker.nack(
                lease,
                NackAction::Retry {
                    error: error.to_string(),
                    visible_at,
                },
            )?;
            self.metrics.incr(names::TASKS_RETRIED);

            info!(
                task_id = %task.id,
                task_name = %task.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "task retry scheduled"
            );

            if attempt == 1 {
                let event = LifecycleEvent::new(
                    task.id,
                    task.name.clone(),
                    now,
                    LifecycleEventKind::Retrying {
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        visible_at,
                    },
                );
                if let Err(e) = self.events.publish(event) {
                    warn!(task_id = %task.id, error = ?e, "failed to publish lifecycle event");
                }
            }

            return Ok(RetryDecision::Scheduled {
                attempt,
                delay,
                visible_at,
            });
        }

        let buried = broker.nack(
            lease,
            NackAction::DeadLetter {
                error: error.to_string(),
            },
        )?;
        let entry = self.dead_letters.route(&buried, error)?;
        Ok(RetryDecision::DeadLettered(entry))
    }
}
