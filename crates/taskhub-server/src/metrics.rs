//! Prometheus metrics for the taskhub server.
//!
//! This module provides:
//! - HTTP request metrics (count, latency, timeouts)
//! - Cache metrics (hit/miss rates, backend errors)
//! - Rate limiter decisions
//! - Lock acquisitions and timeouts

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
    pub const HTTP_REQUEST_TIMEOUTS_TOTAL: &str = "http_request_timeouts_total";

    // Cache metrics
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_ERRORS_TOTAL: &str = "cache_errors_total";

    // Rate limiter
    pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "rate_limit_decisions_total";

    // Locks
    pub const LOCK_ACQUISITIONS_TOTAL: &str = "lock_acquisitions_total";
    pub const LOCK_TIMEOUTS_TOTAL: &str = "lock_timeouts_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics renders from the handle
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

fn status_class(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

// =============================================================================
// HTTP Metrics
// =============================================================================

/// Record an HTTP request.
pub fn record_http_request(method: &str, status: u16, duration: Duration) {
    counter!(
        names::HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string(),
        "status_class" => status_class(status)
    )
    .increment(1);

    histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_request_timeout() {
    counter!(names::HTTP_REQUEST_TIMEOUTS_TOTAL).increment(1);
}

// =============================================================================
// Cache Metrics
// =============================================================================

/// Record a cache hit. `entry` is `task` or `list`.
pub fn record_cache_hit(entry: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "entry" => entry).increment(1);
}

pub fn record_cache_miss(entry: &'static str) {
    counter!(names::CACHE_MISSES_TOTAL, "entry" => entry).increment(1);
}

/// Record a swallowed cache backend failure.
pub fn record_cache_error(operation: &'static str) {
    counter!(names::CACHE_ERRORS_TOTAL, "operation" => operation).increment(1);
}

// =============================================================================
// Admission and Locking
// =============================================================================

pub fn record_rate_limit_decision(allowed: bool) {
    let decision = if allowed { "allowed" } else { "denied" };
    counter!(names::RATE_LIMIT_DECISIONS_TOTAL, "decision" => decision).increment(1);
}

pub fn record_lock_acquired() {
    counter!(names::LOCK_ACQUISITIONS_TOTAL).increment(1);
}

pub fn record_lock_timeout() {
    counter!(names::LOCK_TIMEOUTS_TOTAL).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_class() {
        assert_eq!(status_class(204), "2xx");
        assert_eq!(status_class(429), "4xx");
        assert_eq!(status_class(504), "5xx");
        assert_eq!(status_class(101), "other");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_cache_hit("task");
        record_rate_limit_decision(false);
        record_http_request("GET", 200, Duration::from_millis(3));
    }
}
