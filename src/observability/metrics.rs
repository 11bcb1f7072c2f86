//! # Metrics Registry
//!
//! Prometheus metrics surface for the gateway. Each registry owns its own
//! recorder rather than installing a global one, which keeps instances
//! independent under test and lets the server render a snapshot on demand.
//!
//! Required series:
//! - `api_requests_total{route, method, status_code}`
//! - `api_response_time_seconds{route, method}` (histogram)
//! - `circuit_breaker_state{service_id}` (0=CLOSED, 1=OPEN, 2=HALF_OPEN)
//! - `circuit_breaker_failures_total{service_id, error_type}`
//!
//! Recording is infallible: nothing in this module returns an error to the
//! request path.

use metrics::{Key, Label, Level, Metadata, Recorder};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

/// Histogram buckets for response time, in seconds
const RESPONSE_TIME_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0];

/// Per-instance Prometheus registry
pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full("api_response_time_seconds".to_string()),
                RESPONSE_TIME_BUCKETS,
            )
            .expect("bucket list is non-empty")
            .build_recorder();
        let handle = recorder.handle();
        Self { recorder, handle }
    }

    fn metadata(&self) -> Metadata<'static> {
        Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
    }

    /// Count a completed request and record its latency.
    pub fn record_request(&self, route: &str, method: &str, status_code: u16, elapsed_secs: f64) {
        let metadata = self.metadata();
        let counter_key = Key::from_parts(
            "api_requests_total",
            vec![
                Label::new("route", route.to_string()),
                Label::new("method", method.to_string()),
                Label::new("status_code", status_code.to_string()),
            ],
        );
        self.recorder
            .register_counter(&counter_key, &metadata)
            .increment(1);

        let histogram_key = Key::from_parts(
            "api_response_time_seconds",
            vec![
                Label::new("route", route.to_string()),
                Label::new("method", method.to_string()),
            ],
        );
        self.recorder
            .register_histogram(&histogram_key, &metadata)
            .record(elapsed_secs);
    }

    /// Count a breaker success record.
    pub fn record_breaker_success(&self, service_id: &str) {
        let key = Key::from_parts(
            "circuit_breaker_successes_total",
            vec![Label::new("service_id", service_id.to_string())],
        );
        self.recorder
            .register_counter(&key, &self.metadata())
            .increment(1);
    }

    /// Count a breaker failure record, labeled with the error kind.
    pub fn record_breaker_failure(&self, service_id: &str, error_type: &str) {
        let key = Key::from_parts(
            "circuit_breaker_failures_total",
            vec![
                Label::new("service_id", service_id.to_string()),
                Label::new("error_type", error_type.to_string()),
            ],
        );
        self.recorder
            .register_counter(&key, &self.metadata())
            .increment(1);
    }

    /// Count a request rejected by an open breaker.
    pub fn record_breaker_rejection(&self, service_id: &str) {
        let key = Key::from_parts(
            "circuit_breaker_rejections_total",
            vec![Label::new("service_id", service_id.to_string())],
        );
        self.recorder
            .register_counter(&key, &self.metadata())
            .increment(1);
    }

    /// Publish a breaker's current state code (0=CLOSED, 1=OPEN, 2=HALF_OPEN).
    pub fn set_breaker_state(&self, service_id: &str, state_code: u8) {
        let key = Key::from_parts(
            "circuit_breaker_state",
            vec![Label::new("service_id", service_id.to_string())],
        );
        self.recorder
            .register_gauge(&key, &self.metadata())
            .set(state_code as f64);
    }

    /// Render the Prometheus exposition-format snapshot.
    pub fn snapshot_text(&self) -> String {
        self.handle.render()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_counter_appears_in_snapshot() {
        let registry = MetricsRegistry::new();
        registry.record_request("svc", "GET", 200, 0.042);
        let text = registry.snapshot_text();
        assert!(text.contains("api_requests_total"));
        assert!(text.contains("route=\"svc\""));
        assert!(text.contains("method=\"GET\""));
        assert!(text.contains("status_code=\"200\""));
    }

    #[test]
    fn response_time_uses_configured_buckets() {
        let registry = MetricsRegistry::new();
        registry.record_request("svc", "GET", 200, 0.03);
        let text = registry.snapshot_text();
        assert!(text.contains("api_response_time_seconds"));
        assert!(text.contains("le=\"0.05\""));
        assert!(text.contains("le=\"10\""));
    }

    #[test]
    fn breaker_series_are_labeled() {
        let registry = MetricsRegistry::new();
        registry.set_breaker_state("svc", 1);
        registry.record_breaker_failure("svc", "timeout");
        registry.record_breaker_rejection("svc");
        let text = registry.snapshot_text();
        assert!(text.contains("circuit_breaker_state"));
        assert!(text.contains("circuit_breaker_failures_total"));
        assert!(text.contains("error_type=\"timeout\""));
        assert!(text.contains("circuit_breaker_rejections_total"));
    }

    #[test]
    fn registries_are_independent() {
        let a = MetricsRegistry::new();
        let b = MetricsRegistry::new();
        a.record_request("only-a", "GET", 200, 0.01);
        assert!(a.snapshot_text().contains("only-a"));
        assert!(!b.snapshot_text().contains("only-a"));
    }
}
