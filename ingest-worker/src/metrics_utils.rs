use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::Response,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use tracing::info;

pub const MESSAGES_CONSUMED: &str = "ingest_messages_consumed_total";
pub const MESSAGES_PRODUCED: &str = "ingest_messages_produced_total";
pub const UPSERTS: &str = "ingest_upserts_total";
pub const PROCESSING_ERRORS: &str = "ingest_processing_errors_total";
pub const DEAD_LETTER: &str = "ingest_dead_letter_total";
pub const DEAD_LETTER_ERRORS: &str = "ingest_dead_letter_errors_total";
pub const FLUSH_ERRORS: &str = "ingest_flush_errors_total";
pub const FLUSH_DROPPED_MESSAGES: &str = "ingest_flush_dropped_messages_total";
pub const UNKNOWN_TOPIC: &str = "ingest_unknown_topic_total";
pub const CONSUMER_ERRORS: &str = "ingest_consumer_errors_total";
pub const OFFSET_STORE_ERRORS: &str = "ingest_offset_store_errors_total";

pub const BATCH_QUEUE_DEPTH: &str = "ingest_batch_queue_depth";
pub const INFLIGHT_UPSERTS: &str = "ingest_inflight_upserts";
pub const DISPATCH_SATURATION: &str = "ingest_dispatch_saturation_percent";

pub const STAGE_LATENCY: &str = "ingest_stage_latency_ms";

pub const HTTP_REQUESTS: &str = "ingest_http_requests_total";
pub const HTTP_REQUEST_DURATION: &str = "ingest_http_request_duration_seconds";

const STAGE_LATENCY_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
];

pub async fn serve(router: Router, bind: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "serving health and metrics");
    axum::serve(listener, router).await
}

/// Mounts `/metrics` on `router` and records every request it serves.
pub fn with_metrics(router: Router) -> Result<Router, BuildError> {
    let handle = install_recorder()?;

    Ok(router
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .layer(axum::middleware::from_fn(record_request)))
}

pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(STAGE_LATENCY.to_owned()),
            STAGE_LATENCY_BUCKETS,
        )?
        .install_recorder()
}

async fn record_request(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| req.uri().path().to_owned(), |m| m.as_str().to_owned());
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(HTTP_REQUESTS, &labels).increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION, &labels).record(start.elapsed().as_secs_f64());
    response
}

/// Records the elapsed milliseconds of a pipeline stage when `fin` is called.
///
/// Dropping the guard without calling `fin` records nothing, so failed attempts stay out of
/// the latency distribution.
pub struct StageTimer {
    stage: &'static str,
    start: Instant,
}

impl StageTimer {
    pub fn start(stage: &'static str) -> Self {
        Self {
            stage,
            start: Instant::now(),
        }
    }

    pub fn fin(self) {
        metrics::histogram!(STAGE_LATENCY, "stage" => self.stage)
            .record(self.start.elapsed().as_secs_f64() * 1000.0);
    }
}
