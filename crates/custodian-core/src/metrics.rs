//! Observability sink.

use std::time::Duration;

/// Receives named counters and timings.
///
/// Names are dotted, e.g. `license.validate.failure`.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str);

    fn observe(&self, name: &'static str, elapsed: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &'static str) {}

    fn observe(&self, _name: &'static str, _elapsed: Duration) {}
}
