use std::sync::LazyLock;

use axum::http::StatusCode;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, TextEncoder, exponential_buckets,
    register_counter_vec, register_histogram_vec,
};

/// Request metrics, registered once in the process-wide default registry.
pub static METRICS: LazyLock<AppMetrics> = LazyLock::new(AppMetrics::new);

pub struct AppMetrics {
    /// Counter of fully handled requests.
    pub handled_total: CounterVec,
    /// Histogram of handling time of requests.
    pub handling_duration_seconds: HistogramVec,
}

impl AppMetrics {
    fn new() -> Self {
        Self {
            handled_total: register_counter_vec!(
                Opts::new("handled_total", "Counter of fully handled requests")
                    .namespace("apigw")
                    .subsystem("logger"),
                &["clientid", "status"]
            )
            .unwrap(),
            handling_duration_seconds: register_histogram_vec!(
                HistogramOpts::new(
                    "handling_duration_seconds",
                    "Histogram of handling time of requests"
                )
                .namespace("apigw")
                .subsystem("logger")
                .buckets(exponential_buckets(0.0005, 2.0, 13).unwrap()),
                &["method"]
            )
            .unwrap(),
        }
    }
}

/// Serve the default registry in the Prometheus text exposition format.
pub async fn exposition() -> Result<String, (StatusCode, String)> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("encoding metrics: {e}")))?;
    String::from_utf8(buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("encoding metrics: {e}")))
}
