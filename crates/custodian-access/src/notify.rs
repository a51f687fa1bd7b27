//! Best-effort event publication and metrics.

use std::sync::Arc;
use std::time::Duration;

use custodian_core::{Event, EventKind, EventPublisher, MetricsSink, NoopMetrics, NoopPublisher};

/// Shared handle to the observability ports.
///
/// Publishing never fails the caller: errors are logged at `warn` and counted.
#[derive(Clone)]
pub struct Notifier {
    events: Arc<dyn EventPublisher>,
    metrics: Arc<dyn MetricsSink>,
}

impl Notifier {
    pub fn new(events: Arc<dyn EventPublisher>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { events, metrics }
    }

    /// A notifier that drops everything.
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopPublisher), Arc::new(NoopMetrics))
    }

    pub fn publish(&self, kind: EventKind, payload: serde_json::Value, now: i64) {
        let event = Event::new(kind, payload, now);
        if let Err(e) = self.events.publish(&event) {
            tracing::warn!(subject = kind.subject(), error = %e, "event publish failed");
            self.metrics.increment("events.publish_failed");
        }
    }

    pub fn increment(&self, name: &'static str) {
        self.metrics.increment(name);
    }

    pub fn observe(&self, name: &'static str, elapsed: Duration) {
        self.metrics.observe(name, elapsed);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::noop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custodian_core::PublishError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Failing;

    impl EventPublisher for Failing {
        fn publish(&self, event: &Event) -> Result<(), PublishError> {
            Err(PublishError::new(event.kind, "bus unavailable"))
        }
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl MetricsSink for Counter {
        fn increment(&self, name: &'static str) {
            if name == "events.publish_failed" {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn observe(&self, _name: &'static str, _elapsed: Duration) {}
    }

    #[test]
    fn test_publish_failure_is_swallowed_and_counted() {
        let counter = Arc::new(Counter::default());
        let notifier = Notifier::new(Arc::new(Failing), counter.clone());

        notifier.publish(EventKind::LicenseIssued, serde_json::json!({}), 0);
        notifier.publish(EventKind::LicenseRevoked, serde_json::json!({}), 0);

        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }
}
