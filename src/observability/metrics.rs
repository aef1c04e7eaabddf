//! # Metrics Collection
//!
//! Thin helpers over the `metrics` facade plus installation of the
//! Prometheus exporter. When no recorder is installed (tests, or metrics
//! disabled in configuration) every helper is a cheap no-op.
//!
//! ## Exported series
//! - `gateway_requests_total{route,status}`
//! - `gateway_request_duration_seconds{route}`
//! - `gateway_upstream_attempts_total{group,outcome}`
//! - `gateway_retries_total{group}`
//! - `gateway_health_transitions_total{group,to}`
//! - `gateway_health_probes_total{group,result}`
//! - `gateway_upstream_in_flight{instance}`
//! - `gateway_rejected_requests_total{reason}`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

use crate::core::error::{GatewayError, GatewayResult};
use crate::discovery::registry::UpstreamInstance;
use crate::observability::health::HealthState;

/// Latency buckets in seconds, tuned for a 5s request deadline
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Install the global Prometheus recorder and return a handle for rendering
///
/// Can only succeed once per process.
pub fn install_prometheus() -> GatewayResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_request_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )
        .map_err(|e| GatewayError::internal(format!("Failed to set histogram buckets: {}", e)))?
        .install_recorder()
        .map_err(|e| GatewayError::internal(format!("Failed to install metrics recorder: {}", e)))
}

/// Record a finished inbound request
pub fn record_request(route: &str, status: u16, duration: Duration) {
    metrics::counter!(
        "gateway_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "route" => route.to_string())
        .record(duration.as_secs_f64());
}

/// Record one upstream attempt and how it ended
pub fn record_upstream_attempt(group: &str, outcome: &'static str) {
    metrics::counter!(
        "gateway_upstream_attempts_total",
        "group" => group.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_retry(group: &str) {
    metrics::counter!("gateway_retries_total", "group" => group.to_string()).increment(1);
}

pub fn record_health_transition(group: &str, to: HealthState) {
    metrics::counter!(
        "gateway_health_transitions_total",
        "group" => group.to_string(),
        "to" => to.as_str()
    )
    .increment(1);
}

pub fn record_probe(group: &str, healthy: bool) {
    let result = if healthy { "success" } else { "failure" };
    metrics::counter!(
        "gateway_health_probes_total",
        "group" => group.to_string(),
        "result" => result
    )
    .increment(1);
}

pub fn record_in_flight(instance: &UpstreamInstance, in_flight: usize) {
    metrics::gauge!("gateway_upstream_in_flight", "instance" => instance.id().to_string())
        .set(in_flight as f64);
}

/// Record a request rejected before reaching an upstream
pub fn record_rejected(reason: &'static str) {
    metrics::counter!("gateway_rejected_requests_total", "reason" => reason).increment(1);
}
