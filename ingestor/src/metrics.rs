use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_messages_total",
        "Total messages received from MQTT"
    ))
    .expect("valid metric");
    pub static ref DECODED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_decoded_total",
        "Total messages decoded into readings"
    ))
    .expect("valid metric");
    pub static ref REJECTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_rejected_total",
            "Total messages dropped at decode time"
        ),
        &["reason"]
    )
    .expect("valid metric");
    pub static ref HANDLER_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_handler_failures_total",
        "Total decoded readings the handler failed to persist"
    ))
    .expect("valid metric");
    pub static ref HISTORY_WRITE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_history_write_failures_total",
        "Total failed history store writes"
    ))
    .expect("valid metric");
    pub static ref LATEST_WRITE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_latest_write_failures_total",
        "Total failed latest-value store writes (absorbed)"
    ))
    .expect("valid metric");
    pub static ref DB_RETRIES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_retries_total",
        "Total transient database insert failures that were retried"
    ))
    .expect("valid metric");
    pub static ref PROCESS_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_process_latency_seconds",
            "Time taken to persist one reading to both stores"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .expect("valid metric");
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_channel_full_total",
        "Total number of times channel was full (backpressure events)"
    ))
    .expect("valid metric");
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DECODED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REJECTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(HANDLER_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(HISTORY_WRITE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LATEST_WRITE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_RETRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PROCESS_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(CHANNEL_FULL_TOTAL.clone()))?;
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
