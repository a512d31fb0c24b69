use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add the prometheus endpoint and request metrics middleware, should be called last.
pub fn setup_metrics_routes(router: Router, recorder_handle: PrometheusHandle) -> Router {
    router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

/// Install the global prometheus recorder. Fails when called twice in one process.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    // Cache and queue round trips sit at the low end; event processing with
    // retries and backoff can take tens of seconds.
    const BUCKETS: &[f64] = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_counter!(
        "bridge_events_processed_total",
        "Bridge events applied to the cache and enqueued for persistence"
    );
    metrics::describe_counter!(
        "bridge_events_dropped_total",
        "Bridge events dropped because they could not be decoded or normalized"
    );
    metrics::describe_counter!(
        "bridge_events_failed_total",
        "Bridge events that still failed after all retries"
    );
    metrics::describe_counter!(
        "bridge_cache_compensations_total",
        "Cache increments reverted after a later step failed"
    );
    metrics::describe_gauge!(
        "bridge_coordinator_state",
        "Current state of the ingestion coordinator"
    );
    metrics::describe_counter!(
        "persistence_jobs_completed",
        "Persistence jobs written to the durable store"
    );
    metrics::describe_counter!(
        "persistence_jobs_dead_lettered",
        "Persistence jobs that exhausted their attempts"
    );
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
