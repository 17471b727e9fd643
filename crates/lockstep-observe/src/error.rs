//! Error types for the instrumentation layer.

/// Errors that can occur while setting up metric export.
#[derive(Debug, thiserror::Error)]
pub enum ObserveError {
    /// A global metrics recorder could not be installed, usually because
    /// one is already installed for this process.
    #[error("failed to install prometheus recorder: {0}")]
    RecorderInstall(#[from] metrics_exporter_prometheus::BuildError),
}
