//! Probe delegates health checks to the upstream API server: the controller
//! is only as healthy as its connection to the cluster.

use axum::http::StatusCode;
use tracing::debug;

/// Probe names an upstream health endpoint.
#[derive(Clone, Copy, Debug)]
pub enum Probe {
    /// Healthz, served by the main server.
    Healthz,
    /// Livez, served by the main server.
    Livez,
    /// Readyz, served by the telemetry server.
    Readyz,
}

impl Probe {
    /// Path returns the probe's request path, identical on both ends.
    pub fn path(&self) -> &'static str {
        match self {
            Probe::Healthz => "/healthz",
            Probe::Livez => "/livez",
            Probe::Readyz => "/readyz",
        }
    }

    /// Check issues the probe against the API server; any failure is 503.
    pub async fn check(&self, client: &kube::Client) -> (StatusCode, &'static str) {
        let request = match http::Request::get(self.path()).body(Vec::new()) {
            Ok(request) => request,
            Err(err) => {
                debug!(probe = self.path(), error = %err, "error building probe request");
                return (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
            }
        };
        match client.request_text(request).await {
            Ok(_) => (StatusCode::OK, "OK"),
            Err(err) => {
                debug!(probe = self.path(), error = %err, "probe failed");
                (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
            }
        }
    }
}
