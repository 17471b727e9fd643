//! Query instrumentation for the lockstep database layer.
//!
//! Every logical database operation is wrapped in an [`Observation`]: the
//! operation is started with [`QueryObserver::observe`] (or the free
//! [`observe`] function), which only captures a timestamp and a label, and
//! is closed with [`Observation::finish`], which records one count sample
//! and one duration sample keyed by operation name and outcome.
//!
//! Samples go through the `metrics` facade. When no recorder is installed
//! the facade discards them, so instrumented calls never depend on a
//! metrics backend being present. [`install_prometheus_exporter`] installs
//! a process-wide Prometheus recorder for external scraping.
//!
//! # Series
//!
//! | Name | Kind | Labels |
//! |------|------|--------|
//! | `lockstep_db_queries_total` | counter | `operation`, `outcome` |
//! | `lockstep_db_query_duration_seconds` | histogram | `operation`, `outcome` |
//!
//! # Usage
//!
//! ```rust,ignore
//! use lockstep_observe::QueryObserver;
//!
//! let observer = QueryObserver::from_env();
//! let observation = observer.observe("get_metadata");
//! let result = run_query();
//! observation.finish(&result);
//! ```

mod error;
mod exporter;
mod observer;

pub use error::ObserveError;
pub use exporter::{describe_metrics, install_prometheus_exporter};
pub use observer::{
    observe, slow_threshold_from_env, Observation, Outcome, QueryObserver, SLOW_QUERY_ENV,
};

/// Queries executed (counter, labels: operation, outcome).
pub const QUERIES_TOTAL: &str = "lockstep_db_queries_total";
/// Query duration in seconds (histogram, labels: operation, outcome).
pub const QUERY_DURATION_SECONDS: &str = "lockstep_db_query_duration_seconds";
