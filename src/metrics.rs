//! Metrics helpers for Hermes.
//!
//! Thin wrappers over the `metrics` crate macros with described metric
//! names; no exporter is embedded, any compatible recorder can be
//! installed by the host. The `RequestTimer` records durations via `Drop`
//! so early returns and errors are still measured.
//!
//! Metric families:
//! * `hermes_requests_total` (counter: path, method, status)
//! * `hermes_request_duration_seconds` (histogram: path, method)
//! * `hermes_upstream_requests_total` (counter: upstream, status)
//! * `hermes_upstream_request_duration_seconds` (histogram: upstream)
//! * `hermes_rate_limited_total` (counter: scope)
//! * `hermes_breaker_rejections_total` (counter: target, state)
//! * `hermes_backend_health_status` (gauge per upstream)

use std::{collections::HashMap, sync::Mutex, time::Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const HERMES_REQUESTS_TOTAL: &str = "hermes_requests_total";
pub const HERMES_REQUEST_DURATION_SECONDS: &str = "hermes_request_duration_seconds";
pub const HERMES_UPSTREAM_REQUESTS_TOTAL: &str = "hermes_upstream_requests_total";
pub const HERMES_UPSTREAM_REQUEST_DURATION_SECONDS: &str =
    "hermes_upstream_request_duration_seconds";
pub const HERMES_RATE_LIMITED_TOTAL: &str = "hermes_rate_limited_total";
pub const HERMES_BREAKER_REJECTIONS_TOTAL: &str = "hermes_breaker_rejections_total";
pub const HERMES_BACKEND_HEALTH_STATUS: &str = "hermes_backend_health_status";

/// Last-written gauge values, kept for the JSON snapshot endpoint.
static GAUGE_SNAPSHOT: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| {
    describe_counter!(
        HERMES_REQUESTS_TOTAL,
        Unit::Count,
        "Total HTTP requests processed by the gateway."
    );
    describe_histogram!(
        HERMES_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of requests processed by the gateway."
    );
    describe_counter!(
        HERMES_UPSTREAM_REQUESTS_TOTAL,
        Unit::Count,
        "Total requests forwarded to upstream services."
    );
    describe_histogram!(
        HERMES_UPSTREAM_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of forwarded upstream requests."
    );
    describe_counter!(
        HERMES_RATE_LIMITED_TOTAL,
        Unit::Count,
        "Requests denied by the rate limiter, by scope."
    );
    describe_counter!(
        HERMES_BREAKER_REJECTIONS_TOTAL,
        Unit::Count,
        "Requests rejected by an open or probing circuit."
    );
    describe_gauge!(
        HERMES_BACKEND_HEALTH_STATUS,
        "Registry-reported health per upstream (1 healthy, 0 unhealthy)."
    );
    Mutex::new(HashMap::new())
});

/// Register metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&GAUGE_SNAPSHOT);
}

pub fn increment_request_total(path: &str, method: &str, status: u16) {
    counter!(
        HERMES_REQUESTS_TOTAL,
        "path" => path.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_request_duration(path: &str, method: &str, duration: std::time::Duration) {
    histogram!(
        HERMES_REQUEST_DURATION_SECONDS,
        "path" => path.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_upstream_request(upstream: &str, status: u16, duration: std::time::Duration) {
    counter!(
        HERMES_UPSTREAM_REQUESTS_TOTAL,
        "upstream" => upstream.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        HERMES_UPSTREAM_REQUEST_DURATION_SECONDS,
        "upstream" => upstream.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn increment_rate_limited(scope: &str) {
    counter!(HERMES_RATE_LIMITED_TOTAL, "scope" => scope.to_string()).increment(1);
}

pub fn increment_breaker_rejection(target: &str, state: &str) {
    counter!(
        HERMES_BREAKER_REJECTIONS_TOTAL,
        "target" => target.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

pub fn set_backend_health_status(upstream: &str, healthy: bool) {
    let value = if healthy { 1.0 } else { 0.0 };
    if let Ok(mut gauges) = GAUGE_SNAPSHOT.lock() {
        gauges.insert(format!("backend_health_{upstream}"), value);
    }
    gauge!(HERMES_BACKEND_HEALTH_STATUS, "upstream" => upstream.to_string()).set(value);
}

/// Snapshot of gauge values for the `/metrics` JSON endpoint.
pub fn snapshot() -> HashMap<String, f64> {
    GAUGE_SNAPSHOT
        .lock()
        .map(|gauges| gauges.clone())
        .unwrap_or_default()
}

/// RAII timer for inbound request duration.
pub struct RequestTimer {
    start: Instant,
    path: String,
    method: String,
}

impl RequestTimer {
    pub fn new(path: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            path: path.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.path, &self.method, self.start.elapsed());
    }
}
