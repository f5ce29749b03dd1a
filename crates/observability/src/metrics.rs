//! In-process metrics registry.
//!
//! An external collector scrapes [`Metrics::snapshot`]; nothing here knows
//! about exporters. Counters are keyed by `(name, label)`; the empty label
//! is used for unlabelled counters. Histograms record stage durations in
//! fixed millisecond buckets.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

/// Well-known metric and stage names.
pub mod names {
    pub const TASKS_SUBMITTED: &str = "tasks_submitted_total";
    pub const TASKS_SUCCEEDED: &str = "tasks_succeeded_total";
    pub const TASKS_RETRIED: &str = "tasks_retried_total";
    pub const TASKS_DEAD_LETTERED: &str = "tasks_dead_lettered_total";
    pub const TASKS_CANCELLED: &str = "tasks_cancelled_total";
    pub const TASKS_REDELIVERED: &str = "tasks_redelivered_total";
    pub const DEQUEUE_CHECKS: &str = "broker_dequeue_checks_total";
    pub const DEQUEUES: &str = "broker_dequeues_total";
    pub const IDEMPOTENCY_HITS: &str = "idempotency_hits_total";
    pub const IDEMPOTENCY_MISSES: &str = "idempotency_misses_total";
    pub const IDEMPOTENCY_IN_FLIGHT: &str = "idempotency_in_flight_total";
    pub const VERSION_CONFLICTS: &str = "lock_version_conflicts_total";
    pub const WAL_APPENDS: &str = "wal_appends_total";
    pub const WAL_REPLAYED: &str = "wal_replayed_total";
    pub const SAGAS: &str = "sagas_total";
    /// Labelled by error kind.
    pub const ERRORS: &str = "errors_total";

    pub const STAGE_ENQUEUE: &str = "enqueue";
    pub const STAGE_EXECUTE: &str = "execute";
    pub const STAGE_WAL_APPEND: &str = "wal_append";
    pub const STAGE_REPLAY: &str = "replay";
    pub const STAGE_SAGA_STEP: &str = "saga_step";
    pub const STAGE_DRAIN: &str = "drain";
}

/// Upper bounds (inclusive, milliseconds) of the histogram buckets. A final
/// overflow bucket catches everything slower.
pub const BUCKET_BOUNDS_MS: [u64; 10] = [1, 5, 10, 50, 100, 500, 1_000, 5_000, 10_000, 60_000];

#[derive(Debug, Clone, Default)]
struct Histogram {
    buckets: [u64; BUCKET_BOUNDS_MS.len() + 1],
    count: u64,
    sum_ms: u64,
    max_ms: u64,
}

impl Histogram {
    fn observe(&mut self, ms: u64) {
        let idx = BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        self.buckets[idx] += 1;
        self.count += 1;
        self.sum_ms = self.sum_ms.saturating_add(ms);
        self.max_ms = self.max_ms.max(ms);
    }
}

#[derive(Debug, Default)]
struct Registry {
    counters: BTreeMap<(String, String), u64>,
    histograms: BTreeMap<String, Histogram>,
}

/// Thread-safe metrics registry.
#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<Registry>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str) {
        self.add(name, "", 1);
    }

    pub fn incr_labeled(&self, name: &str, label: &str) {
        self.add(name, label, 1);
    }

    pub fn add(&self, name: &str, label: &str, by: u64) {
        let mut reg = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *reg
            .counters
            .entry((name.to_string(), label.to_string()))
            .or_default() += by;
    }

    /// Record one duration sample for `stage`.
    pub fn observe(&self, stage: &str, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let mut reg = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        reg.histograms.entry(stage.to_string()).or_default().observe(ms);
    }

    /// Current value of an unlabelled counter.
    pub fn counter(&self, name: &str) -> u64 {
        self.counter_labeled(name, "")
    }

    pub fn counter_labeled(&self, name: &str, label: &str) -> u64 {
        let reg = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        reg.counters
            .get(&(name.to_string(), label.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of a counter across all of its labels.
    pub fn counter_total(&self, name: &str) -> u64 {
        let reg = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        reg.counters
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, v)| *v)
            .sum()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let reg = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        let mut counters: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for ((name, label), value) in &reg.counters {
            counters
                .entry(name.clone())
                .or_default()
                .insert(label.clone(), *value);
        }

        let histograms = reg
            .histograms
            .iter()
            .map(|(stage, h)| {
                (
                    stage.clone(),
                    HistogramSnapshot {
                        bucket_bounds_ms: BUCKET_BOUNDS_MS.to_vec(),
                        buckets: h.buckets.to_vec(),
                        count: h.count,
                        sum_ms: h.sum_ms,
                        max_ms: h.max_ms,
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            counters,
            histograms,
        }
    }
}

/// Point-in-time copy of every metric.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// name -> label -> value (`""` is the unlabelled series).
    pub counters: BTreeMap<String, BTreeMap<String, u64>>,
    pub histograms: BTreeMap<String, HistogramSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub bucket_bounds_ms: Vec<u64>,
    /// One more entry than `bucket_bounds_ms`: the last is the overflow bucket.
    pub buckets: Vec<u64>,
    pub count: u64,
    pub sum_ms: u64,
    pub max_ms: u64,
}
