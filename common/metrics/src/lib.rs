use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::middleware::{from_fn, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

// Batch and chunk sizes, in messages
const SIZE_BUCKETS: &[f64] = &[
    1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
];

const SECONDS_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Serves `router` on `bind` until the listener fails.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}

/// Installs the global recorder, then adds `/metrics` and request tracking
/// to `router`. Call it after every other route is added.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let handle = setup_metrics_recorder()?;

    Ok(router
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .layer(from_fn(track_metrics)))
}

/// Histograms ending in `_size` get message-count buckets, the ones ending in
/// `_seconds` get duration buckets.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("_size".to_string()), SIZE_BUCKETS)?
        .set_buckets_for_metric(Matcher::Suffix("_seconds".to_string()), SECONDS_BUCKETS)?
        .install_recorder()
}

/// Counts requests and records their latency, labelled by route template.
pub async fn track_metrics(route: Option<MatchedPath>, req: Request, next: Next) -> Response {
    let route = match route {
        Some(route) => route.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().as_str().to_owned();
    let started = Instant::now();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());

    response
}

/// Records the seconds between its creation and its drop into a histogram.
#[must_use = "the timing is recorded when the guard is dropped"]
pub struct TimingGuard {
    name: &'static str,
    started: Instant,
}

pub fn timing_guard(name: &'static str) -> TimingGuard {
    TimingGuard {
        name,
        started: Instant::now(),
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        metrics::histogram!(self.name).record(self.started.elapsed().as_secs_f64());
    }
}
