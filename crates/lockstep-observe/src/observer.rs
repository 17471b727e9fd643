//! Start/finish measurement of individual database operations.

use std::time::{Duration, Instant};

use crate::{QUERIES_TOTAL, QUERY_DURATION_SECONDS};

/// Environment variable holding the slow-query threshold in milliseconds.
pub const SLOW_QUERY_ENV: &str = "LOCKSTEP_SLOW_QUERY_MS";

/// How an observed operation ended.
///
/// Only these fixed values are used as the `outcome` label; error details
/// never become labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The operation completed successfully.
    Ok,
    /// The operation returned an error.
    Error,
    /// The observation was dropped without being finished.
    Abandoned,
}

impl Outcome {
    /// Returns the label value for this outcome.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Abandoned => "abandoned",
        }
    }
}

impl<T, E> From<&Result<T, E>> for Outcome {
    fn from(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(_) => Self::Error,
        }
    }
}

/// Reads the slow-query threshold from [`SLOW_QUERY_ENV`].
///
/// Unset, unparsable, or zero values yield `None` (slow-query logging off).
pub fn slow_threshold_from_env() -> Option<Duration> {
    std::env::var(SLOW_QUERY_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

/// Factory for [`Observation`]s sharing one slow-query threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryObserver {
    slow_threshold: Option<Duration>,
}

impl QueryObserver {
    /// Creates an observer. A zero threshold disables slow-query logging.
    pub fn new(slow_threshold: Option<Duration>) -> Self {
        Self {
            slow_threshold: slow_threshold.filter(|t| !t.is_zero()),
        }
    }

    /// Creates an observer whose threshold comes from [`SLOW_QUERY_ENV`].
    pub fn from_env() -> Self {
        Self::new(slow_threshold_from_env())
    }

    /// Returns the slow-query threshold, if one is active.
    pub fn slow_threshold(&self) -> Option<Duration> {
        self.slow_threshold
    }

    /// Starts observing `operation`.
    ///
    /// Only captures the start instant; no I/O and no metric emission
    /// happen until the observation is finished.
    pub fn observe(&self, operation: &'static str) -> Observation {
        Observation {
            operation,
            started: Instant::now(),
            slow_threshold: self.slow_threshold,
            finished: false,
        }
    }
}

/// Starts observing `operation` with no slow-query threshold.
pub fn observe(operation: &'static str) -> Observation {
    QueryObserver::default().observe(operation)
}

/// A single in-flight measurement.
///
/// Each observation owns its own start instant, so observations on
/// different threads never share timer state. Finishing consumes the
/// observation; one dropped unfinished is recorded as
/// [`Outcome::Abandoned`].
#[derive(Debug)]
#[must_use = "an observation records nothing useful until it is finished"]
pub struct Observation {
    operation: &'static str,
    started: Instant,
    slow_threshold: Option<Duration>,
    finished: bool,
}

impl Observation {
    /// The operation label this observation reports under.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Time elapsed since the observation started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Records the outcome of `result` and returns the measured duration.
    pub fn finish<T, E>(self, result: &Result<T, E>) -> Duration {
        self.finish_with(Outcome::from(result))
    }

    /// Records an explicit outcome and returns the measured duration.
    pub fn finish_with(mut self, outcome: Outcome) -> Duration {
        self.record(outcome)
    }

    fn record(&mut self, outcome: Outcome) -> Duration {
        let elapsed = self.started.elapsed();
        self.finished = true;

        metrics::counter!(
            QUERIES_TOTAL,
            "operation" => self.operation,
            "outcome" => outcome.as_str()
        )
        .increment(1);
        metrics::histogram!(
            QUERY_DURATION_SECONDS,
            "operation" => self.operation,
            "outcome" => outcome.as_str()
        )
        .record(elapsed.as_secs_f64());

        if let Some(threshold) = self.slow_threshold {
            if elapsed > threshold {
                tracing::warn!(
                    op = self.operation,
                    outcome = outcome.as_str(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    "slow query"
                );
            }
        }

        elapsed
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(op = self.operation, "observation dropped before finish");
            self.record(Outcome::Abandoned);
        }
    }
}
