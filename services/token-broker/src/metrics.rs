//! Prometheus metrics exposition
//!
//! Service-level metrics, rendered alongside the broker crate's counters:
//!
//! - `token_broker_requests_total` (counter): labels `route`, `status`
//! - `token_broker_request_duration_seconds` (histogram): label `route`

use anyhow::Context;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "token_broker_request_duration_seconds";

/// Provider round trips dominate request time; buckets span 5ms to the
/// largest sensible provider timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> anyhow::Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
        .context("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    builder()?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record a completed request on `route`.
pub fn record_request(route: &'static str, status: u16, duration_secs: f64) {
    metrics::counter!("token_broker_requests_total", "route" => route, "status" => status.to_string())
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "route" => route).record(duration_secs);
}
