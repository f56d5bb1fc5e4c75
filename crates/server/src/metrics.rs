//! Prometheus metrics for the Quarry server.
//!
//! Exposes counters for query submissions and result serving. The `/metrics`
//! endpoint is unauthenticated so Prometheus can scrape it; restrict it at
//! the network level when the server is reachable from outside.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static QUERIES_SUBMITTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_queries_submitted_total",
        "Total number of query submissions",
    )
    .expect("metric creation failed")
});

pub static QUERY_CACHE_HITS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_query_cache_hits_total",
        "Total number of submissions answered from the result cache",
    )
    .expect("metric creation failed")
});

pub static MATERIALIZATIONS_STARTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_materializations_started_total",
        "Total number of submissions that started or joined a materialization",
    )
    .expect("metric creation failed")
});

pub static CHUNKS_SERVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_chunks_served_total",
        "Total number of chunk downloads served",
    )
    .expect("metric creation failed")
});

pub static BYTES_SERVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_bytes_served_total",
        "Total chunk bytes served (compressed size)",
    )
    .expect("metric creation failed")
});

pub static SUBMIT_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "quarry_submit_duration_seconds",
            "Time taken to answer a query submission",
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent: subsequent calls after the first are no-ops, which keeps
/// integration tests that build several routers safe.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(QUERIES_SUBMITTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(QUERY_CACHE_HITS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(MATERIALIZATIONS_STARTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNKS_SERVED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_SERVED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SUBMIT_DURATION.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        // This would panic if any metric creation failed
        register_metrics();
    }
}
