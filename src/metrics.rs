//! Prometheus metrics for the storage layer.
//!
//! Exposes:
//! - `lightrag_storage_operation_duration_seconds` (histogram)
//! - `lightrag_storage_operation_total` (counter with status)
//! - `lightrag_storage_pool_refs` (gauge)
//! - `lightrag_graph_retry_total` (counter)
//! - process metrics via `process` collector

use std::future::Future;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use prometheus::process_collector::ProcessCollector;
use prometheus::{
    default_registry, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounterVec, IntGauge, TextEncoder,
};
use tracing::warn;

use crate::error::{Error, Result};

static PROCESS_COLLECTOR: Lazy<()> = Lazy::new(|| {
    if let Err(err) = default_registry().register(Box::new(ProcessCollector::for_self())) {
        warn!("Failed to register process collector: {}", err);
    }
});

static OPERATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    // Exponential buckets from 1ms up to ~16 seconds.
    let buckets =
        prometheus::exponential_buckets(0.001, 2.0, 15).expect("failed to create histogram buckets");
    register_histogram_vec!(
        "lightrag_storage_operation_duration_seconds",
        "Storage operation duration in seconds",
        &["store", "operation"],
        buckets
    )
    .expect("failed to register operation duration histogram")
});

static OPERATION_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lightrag_storage_operation_total",
        "Total storage operations by status",
        &["store", "operation", "status"]
    )
    .expect("failed to register operation counter")
});

static POOL_REFS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "lightrag_storage_pool_refs",
        "Number of stores holding the shared connection pool"
    )
    .expect("failed to register pool refs gauge")
});

static GRAPH_RETRY_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lightrag_graph_retry_total",
        "Graph mutation retries after transient failures",
        &["operation"]
    )
    .expect("failed to register graph retry counter")
});

/// Ensure collectors are registered.
fn init_collectors() {
    Lazy::force(&PROCESS_COLLECTOR);
    Lazy::force(&OPERATION_DURATION);
    Lazy::force(&OPERATION_TOTAL);
    Lazy::force(&POOL_REFS);
    Lazy::force(&GRAPH_RETRY_TOTAL);
}

/// Record a finished storage operation with duration and status.
pub fn record_operation(store: &'static str, operation: &'static str, duration: Duration, success: bool) {
    init_collectors();
    OPERATION_DURATION
        .with_label_values(&[store, operation])
        .observe(duration.as_secs_f64());
    OPERATION_TOTAL
        .with_label_values(&[store, operation, if success { "ok" } else { "error" }])
        .inc();
}

/// Time a storage future and record its outcome.
pub async fn observe<T, F>(store: &'static str, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let result = fut.await;
    record_operation(store, operation, started.elapsed(), result.is_ok());
    result
}

/// Publish the connection manager reference count.
pub fn set_pool_refs(refs: usize) {
    init_collectors();
    POOL_REFS.set(refs as i64);
}

pub fn record_graph_retry(operation: &'static str) {
    init_collectors();
    GRAPH_RETRY_TOTAL.with_label_values(&[operation]).inc();
}

/// Render the default registry in the Prometheus text format.
pub fn encode_text() -> Result<String> {
    init_collectors();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Error::Serialization(format!("failed to encode metrics: {err}")))?;
    String::from_utf8(buffer)
        .map_err(|err| Error::Serialization(format!("metrics are not UTF-8: {err}")))
}
