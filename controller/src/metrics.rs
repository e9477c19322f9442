//! Metrics contains the self-telemetry setup for the controller.

use metrics::{describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::Result;

/// HTTP_REQUEST_DURATION_SECONDS observes the latency of main-server scrapes.
///
/// The metric lives on the telemetry registry so it never pollutes the
/// resource metrics.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Install_recorder installs the process-wide Prometheus recorder backing the
/// telemetry endpoint and returns its render handle.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            DURATION_BUCKETS,
        )?
        .install_recorder()?;
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Duration of main-server HTTP requests."
    );
    Ok(handle)
}
