//! Tracing and metrics (shared setup).

/// Initialize process-wide tracing/logging.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, output format).
pub mod tracing;

/// In-process metrics registry (counters, duration histograms).
pub mod metrics;

pub use metrics::{HistogramSnapshot, Metrics, MetricsSnapshot, names};
