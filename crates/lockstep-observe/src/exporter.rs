//! Metric descriptions and Prometheus export.

use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::ObserveError;
use crate::{QUERIES_TOTAL, QUERY_DURATION_SECONDS};

/// Registers descriptions for every series emitted by this crate.
///
/// Called once after a recorder is installed. Harmless without one.
pub fn describe_metrics() {
    describe_counter!(
        QUERIES_TOTAL,
        Unit::Count,
        "Database operations executed, by operation and outcome"
    );
    describe_histogram!(
        QUERY_DURATION_SECONDS,
        Unit::Seconds,
        "Database operation latency, by operation and outcome"
    );
}

/// Installs the Prometheus recorder globally and returns its handle.
///
/// The handle's `render()` output is what a `/metrics` endpoint serves.
/// Only one recorder can be installed per process.
///
/// # Errors
///
/// Returns `ObserveError::RecorderInstall` if a recorder is already
/// installed or the exporter cannot be built.
pub fn install_prometheus_exporter() -> Result<PrometheusHandle, ObserveError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    tracing::info!("prometheus metrics recorder installed");
    Ok(handle)
}
