//! Prometheus metrics helpers for the Chairlift pipeline.
//!
//! This module provides centralized metrics initialization and the metric
//! descriptions shared by the ingress, consumer, and batch writer components.
//!
//! # Usage
//!
//! ```rust,ignore
//! use chairlift_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     metrics::counter!("ingress_events_accepted_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`ingress_`, `pool_`, `consumer_`, `batch_`, `storage_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: avoided; worker ids are logged, not labelled

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
/// Returns a handle that can be used with [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if the recorder is already installed,
/// instead of panicking.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds `0.0.0.0:{port}` and serves `/metrics` from a background task.
/// Bind errors are returned; the server itself runs until the process exits.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

/// Register descriptions for the metrics emitted by the pipeline.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    // =========================================================================
    // Ingress
    // =========================================================================

    describe_counter!(
        "ingress_events_accepted_total",
        "Events validated and published to the queue"
    );
    describe_counter!(
        "ingress_events_rejected_total",
        "Requests rejected by validation"
    );
    describe_counter!(
        "ingress_publish_errors_total",
        "Publish attempts that failed (pool exhaustion or transport error)"
    );

    // =========================================================================
    // Channel pool
    // =========================================================================

    describe_gauge!("pool_channels_active", "Channels currently borrowed");
    describe_gauge!("pool_channels_idle", "Channels idle in the pool");
    describe_counter!("pool_channels_created_total", "Channels opened by the pool");
    describe_counter!(
        "pool_channels_destroyed_total",
        "Channels closed by the pool (excess idle, broken, or shutdown)"
    );
    describe_counter!(
        "pool_borrow_timeouts_total",
        "Borrow attempts that gave up because the pool was exhausted"
    );
    describe_histogram!(
        "pool_borrow_wait_seconds",
        "Time spent waiting to borrow a channel"
    );

    // =========================================================================
    // Consumers
    // =========================================================================

    describe_counter!(
        "consumer_messages_received_total",
        "Deliveries received from the queue"
    );
    describe_counter!(
        "consumer_poison_messages_total",
        "Deliveries whose payload could not be decoded"
    );
    describe_counter!(
        "consumer_dead_lettered_total",
        "Poison deliveries dead-lettered or rejected after too many attempts"
    );
    describe_gauge!("consumer_workers_running", "Consumer workers still running");

    // =========================================================================
    // Batch writer
    // =========================================================================

    describe_gauge!(
        "batch_queue_depth",
        "Messages waiting in the internal batch queue"
    );
    describe_counter!("batch_flushed_total", "Batches fully committed and acknowledged");
    describe_counter!(
        "batch_events_committed_total",
        "Events durably written and acknowledged"
    );
    describe_counter!(
        "batch_items_retried_total",
        "Write requests resubmitted after being reported unprocessed"
    );
    describe_counter!(
        "batch_events_dead_lettered_total",
        "Events that exhausted the retry budget"
    );
    describe_counter!(
        "batch_ack_failures_total",
        "Acknowledgments that failed at the transport"
    );
    describe_gauge!("batch_workers_running", "Flush workers still running");
    describe_counter!(
        "batch_worker_panics_total",
        "Flush workers that terminated with a panic"
    );
    describe_histogram!(
        "batch_commit_duration_seconds",
        "Time from drain to full acknowledgment of a batch"
    );

    // =========================================================================
    // Storage
    // =========================================================================

    describe_counter!("storage_write_calls_total", "Bulk write calls issued");
    describe_counter!(
        "storage_write_errors_total",
        "Bulk write calls that failed outright"
    );
    describe_histogram!(
        "storage_write_duration_seconds",
        "Time spent in a single bulk write call"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter.
///
/// Convenience wrapper around `metrics::counter!`.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Set a gauge value.
///
/// Convenience wrapper around `metrics::gauge!`.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}

/// Add `delta` to a gauge.
#[inline]
pub fn increment_gauge(name: &'static str, delta: f64) {
    metrics::gauge!(name).increment(delta);
}

/// Subtract `delta` from a gauge.
#[inline]
pub fn decrement_gauge(name: &'static str, delta: f64) {
    metrics::gauge!(name).decrement(delta);
}

/// Record a duration in seconds on a histogram.
#[inline]
pub fn record_duration(name: &'static str, elapsed: std::time::Duration) {
    metrics::histogram!(name).record(elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();

        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_helpers_do_not_panic() {
        ensure_metrics_init();
        increment("test_counter", 0);
        increment("test_counter", 100);
        set_gauge("test_gauge", 42.5);
        set_gauge("test_gauge", -1.0);
        record_duration("test_histogram", std::time::Duration::from_millis(5));
        increment_gauge("test_gauge", 1.0);
        decrement_gauge("test_gauge", 1.0);
    }

    #[test]
    fn test_register_common_metrics_does_not_panic() {
        ensure_metrics_init();
        register_common_metrics();
        register_common_metrics();
    }

    #[test]
    fn test_gauge_helpers_track_running_workers() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            increment_gauge("helper_workers_running", 1.0);
            increment_gauge("helper_workers_running", 1.0);
            increment_gauge("helper_workers_running", 1.0);
            decrement_gauge("helper_workers_running", 1.0);
        });

        let rendered = handle.render();
        let value: f64 = rendered
            .lines()
            .find_map(|line| line.strip_prefix("helper_workers_running "))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(value, 2.0);
    }
}
