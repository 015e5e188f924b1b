//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedigate_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "fedigate_http_request_duration_seconds",
            "HTTP request duration in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method", "endpoint"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("fedigate_activities_received_total", "Inbound activities by type and outcome"),
        &["activity_type", "outcome"]
    ).expect("metric can be created");
    pub static ref ACTIVITIES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("fedigate_activities_sent_total", "Outbound activity deliveries by type and outcome"),
        &["activity_type", "outcome"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedigate_federation_requests_total", "Total number of federation requests"),
        &["kind", "status"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "fedigate_federation_request_duration_seconds",
            "Outbound federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["kind"]
    ).expect("metric can be created");
    pub static ref SIGNATURE_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedigate_signature_failures_total", "Rejected inbound signatures by cause"),
        &["cause"]
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref ACTOR_CACHE_HITS: prometheus::IntCounter = prometheus::IntCounter::new(
        "fedigate_actor_cache_hits_total",
        "Remote actor cache hits"
    ).expect("metric can be created");
    pub static ref ACTOR_CACHE_MISSES: prometheus::IntCounter = prometheus::IntCounter::new(
        "fedigate_actor_cache_misses_total",
        "Remote actor cache misses"
    ).expect("metric can be created");
    pub static ref ACTOR_CACHE_SIZE: IntGauge = IntGauge::new(
        "fedigate_actor_cache_size",
        "Current number of remote actors in cache"
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedigate_errors_total", "Total number of error responses"),
        &["error_type"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(HTTP_REQUESTS_TOTAL.clone()),
            Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()),
            Box::new(ACTIVITIES_RECEIVED.clone()),
            Box::new(ACTIVITIES_SENT.clone()),
            Box::new(FEDERATION_REQUESTS_TOTAL.clone()),
            Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()),
            Box::new(SIGNATURE_FAILURES_TOTAL.clone()),
            Box::new(ACTOR_CACHE_HITS.clone()),
            Box::new(ACTOR_CACHE_MISSES.clone()),
            Box::new(ACTOR_CACHE_SIZE.clone()),
            Box::new(ERRORS_TOTAL.clone()),
        ];

        for collector in collectors {
            if let Err(error) = REGISTRY.register(collector) {
                tracing::warn!(%error, "Failed to register metric");
            }
        }

        tracing::info!("Metrics registry initialized");
    });
}

/// Render all registered metrics in the Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
