//! Server holds the two HTTP surfaces: the main server exposing the resource
//! metrics and its health probes, and the telemetry server exposing the
//! controller's own metrics and readiness.

use std::net::SocketAddr;

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, time::Instant};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::{
    metrics::HTTP_REQUEST_DURATION_SECONDS,
    probe::Probe,
    stores::Registry,
    Result,
};

// OpenMetrics is not emitted; every response is plain text exposition.
const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// MainState is the main server's application state.
#[derive(Clone)]
pub struct MainState {
    /// Registry holding every live store.
    pub registry: Registry,
    /// Client used by the health probes.
    pub client: kube::Client,
}

/// Main_app returns the main server's router.
pub fn main_app(state: MainState) -> Router {
    Router::new()
        .route("/metrics", get(scrape))
        .route("/healthz", get(healthz))
        .route("/livez", get(livez))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Scrape snapshots every store into one buffer so the response is atomic at
// line granularity no matter how the stores move underneath.
async fn scrape(State(state): State<MainState>) -> impl IntoResponse {
    let started = Instant::now();
    let body = state.registry.render();
    metrics::histogram!(HTTP_REQUEST_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    ([(header::CONTENT_TYPE, TEXT_FORMAT)], body)
}

async fn healthz(State(state): State<MainState>) -> impl IntoResponse {
    Probe::Healthz.check(&state.client).await
}

async fn livez(State(state): State<MainState>) -> impl IntoResponse {
    Probe::Livez.check(&state.client).await
}

/// TelemetryState is the telemetry server's application state.
#[derive(Clone)]
pub struct TelemetryState {
    /// Handle rendering the process-wide Prometheus recorder.
    pub handle: PrometheusHandle,
    /// Client used by the readiness probe.
    pub client: kube::Client,
}

/// Telemetry_app returns the telemetry server's router.
pub fn telemetry_app(state: TelemetryState) -> Router {
    Router::new()
        .route("/metrics", get(telemetry_metrics))
        .route("/readyz", get(readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn telemetry_metrics(State(state): State<TelemetryState>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, TEXT_FORMAT)], state.handle.render())
}

async fn readyz(State(state): State<TelemetryState>) -> impl IntoResponse {
    Probe::Readyz.check(&state.client).await
}

/// Serve binds the address and runs the router until the token fires.
pub async fn serve(
    name: &'static str,
    addr: SocketAddr,
    app: Router,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(server = name, %addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    debug!(server = name, "server finished");
    Ok(())
}
