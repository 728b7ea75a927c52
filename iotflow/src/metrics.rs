use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SUBMISSIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotflow_submissions_total",
        "Total telemetry submissions received"
    ))
    .unwrap();
    pub static ref REJECTED_SUBMISSIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "iotflow_rejected_submissions_total",
            "Submissions rejected, by reason"
        ),
        &["reason"]
    )
    .unwrap();
    pub static ref ROWS_WRITTEN_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotflow_rows_written_total",
        "Total measurement rows persisted"
    ))
    .unwrap();
    pub static ref FIELDS_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotflow_fields_dropped_total",
        "Total non-numeric or malformed fields dropped during validation"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotflow_db_failures_total",
        "Total durable store failures"
    ))
    .unwrap();
    pub static ref CACHE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "iotflow_cache_failures_total",
        "Total status cache failures absorbed"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "iotflow_ingest_latency_seconds",
            "Time taken to persist one submission"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref SYNC_RESULTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "iotflow_sync_results_total",
            "Reconciliation outcomes per device"
        ),
        &["outcome"]
    )
    .unwrap();
    pub static ref SYNC_ENABLED: Gauge = Gauge::with_opts(Opts::new(
        "iotflow_sync_enabled",
        "1 when reconciliation writes are enabled"
    ))
    .unwrap();
}

pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(SUBMISSIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REJECTED_SUBMISSIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ROWS_WRITTEN_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FIELDS_DROPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CACHE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INGEST_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(SYNC_RESULTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SYNC_ENABLED.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
