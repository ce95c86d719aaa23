use crate::sync::Stage;
use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Metric name prefix for all pg-sync metrics
const PREFIX: &str = "pgsync";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Sync Metrics
    pub static ref CYCLES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_cycles_total"), "Scheduled sync runs by final outcome"),
        &["outcome"]
    ).expect("Failed to create cycles_total metric");

    pub static ref CYCLE_ATTEMPTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_cycle_attempts_total"), "Individual pipeline attempts"),
        &["result"]
    ).expect("Failed to create cycle_attempts_total metric");

    pub static ref STAGE_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_stage_duration_seconds"),
            "Duration of successful pipeline stages in seconds"
        )
        .buckets(vec![0.01, 0.1, 1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
        &["stage"]
    ).expect("Failed to create stage_duration_seconds metric");

    pub static ref ORPHANED_ARTIFACTS_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_orphaned_artifacts_total"),
        "Artifacts left on disk after a successful transfer"
    ).expect("Failed to create orphaned_artifacts_total metric");

    pub static ref SKIPPED_FIRINGS_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_skipped_firings_total"),
        "Firings skipped because a cycle was still running"
    ).expect("Failed to create skipped_firings_total metric");

    pub static ref CYCLE_RUNNING: Gauge = Gauge::new(
        format!("{PREFIX}_cycle_running"),
        "1 while a sync cycle is in progress"
    ).expect("Failed to create cycle_running metric");

    // HTTP Request Metrics
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(CYCLES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CYCLE_ATTEMPTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(STAGE_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(ORPHANED_ARTIFACTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SKIPPED_FIRINGS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CYCLE_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));

    tracing::debug!("Metrics system initialized");
}

/// Record the final outcome of a firing: `success`, `exhausted` or `cancelled`.
pub fn record_cycle_outcome(outcome: &str) {
    CYCLES_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a single pipeline attempt: `success` or `failure`.
pub fn record_cycle_attempt(result: &str) {
    CYCLE_ATTEMPTS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_stage_duration(stage: Stage, duration: Duration) {
    STAGE_DURATION_SECONDS
        .with_label_values(&[stage.as_str()])
        .observe(duration.as_secs_f64());
}

pub fn record_orphaned_artifact() {
    ORPHANED_ARTIFACTS_TOTAL.inc();
}

pub fn record_skipped_firing() {
    SKIPPED_FIRINGS_TOTAL.inc();
}

/// Keeps a gauge at 1 until dropped, including on unwind.
pub struct RunningGuard {
    gauge: Gauge,
}

impl RunningGuard {
    pub fn set(gauge: &Gauge) -> Self {
        gauge.set(1.0);
        Self {
            gauge: gauge.clone(),
        }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.gauge.set(0.0);
    }
}

/// Marks a sync cycle as running for as long as the guard lives.
pub fn cycle_running() -> RunningGuard {
    RunningGuard::set(&CYCLE_RUNNING)
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

pub fn make_metrics_app() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serves `/metrics` on its own listener until `shutdown` fires.
pub async fn run_metrics_server(
    host: &str,
    port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let address = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind metrics listener on {}", address))?;
    tracing::info!("Metrics available at {}/metrics", address);

    axum::serve(listener, make_metrics_app())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
