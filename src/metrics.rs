//! Prometheus metrics for the hardening layers.
//!
//! Metrics are exposed by a dedicated listener when `METRICS_PORT` is set.
//! Recording functions are safe to call before (or without) initialization;
//! the `metrics` facade drops values when no recorder is installed.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `shield_https_redirects_total` - Requests redirected to the canonical HTTPS origin
//! - `shield_rate_limited_total` - Requests rejected by the rate limiter
//! - `shield_errors_reported_total` - Errors forwarded to the reporter (label: status)
//! - `shield_errors_ignored_total` - Errors filtered as expected client errors (label: status)
//!
//! ## Histograms
//! - `shield_request_duration_seconds` - Request duration (labels: method, status)

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const HTTPS_REDIRECTS_TOTAL: &str = "shield_https_redirects_total";
    pub const RATE_LIMITED_TOTAL: &str = "shield_rate_limited_total";
    pub const ERRORS_REPORTED_TOTAL: &str = "shield_errors_reported_total";
    pub const ERRORS_IGNORED_TOTAL: &str = "shield_errors_ignored_total";
    pub const REQUEST_DURATION_SECONDS: &str = "shield_request_duration_seconds";
}

/// Install the Prometheus exporter and describe every metric.
///
/// # Errors
///
/// Returns a message if the exporter or its listener could not be installed.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::HTTPS_REDIRECTS_TOTAL,
        "Requests redirected to the canonical HTTPS origin"
    );
    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Requests rejected with 503 by the rate limiter"
    );
    describe_counter!(
        names::ERRORS_REPORTED_TOTAL,
        "Errors forwarded to the error reporter"
    );
    describe_counter!(
        names::ERRORS_IGNORED_TOTAL,
        "Errors filtered out as expected client errors"
    );
    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

pub fn record_https_redirect() {
    counter!(names::HTTPS_REDIRECTS_TOTAL).increment(1);
}

pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED_TOTAL).increment(1);
}

pub fn record_error_reported(status: &str) {
    counter!(names::ERRORS_REPORTED_TOTAL, "status" => status.to_string()).increment(1);
}

pub fn record_error_ignored(status: &str) {
    counter!(names::ERRORS_IGNORED_TOTAL, "status" => status.to_string()).increment(1);
}

/// Record HTTP request duration.
pub fn record_request_duration(method: &str, status: &str, duration_secs: f64) {
    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method.to_string(), "status" => status.to_string())
        .record(duration_secs);
}
