//! Error types for database access.

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::context::{Context, ContextError};
use crate::migrations::MigrationError;

/// Errors returned by [`Database`](crate::Database) operations.
///
/// Every variant raised after open carries the name of the operation that
/// failed, so callers can log or report it without extra wrapping.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database file could not be opened or is not a usable database.
    #[error("failed to open database at '{path}': {source}")]
    Open {
        /// Path that was opened.
        path: String,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// The connection pool could not be built.
    #[error("failed to create connection pool for '{path}': {source}")]
    PoolInit {
        /// Path the pool was built for.
        path: String,
        /// The underlying pool error.
        source: r2d2::Error,
    },

    /// The selected driver has not been registered in this process.
    #[error("database driver '{0}' is not registered")]
    DriverNotRegistered(&'static str),

    /// Schema migrations failed while opening the database.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// The operation's bounded context expired before it completed.
    #[error("{op}: deadline exceeded")]
    DeadlineExceeded {
        /// Operation name.
        op: &'static str,
    },

    /// The caller cancelled the operation's context.
    #[error("{op}: cancelled")]
    Cancelled {
        /// Operation name.
        op: &'static str,
    },

    /// The query matched no rows.
    #[error("{op}: not found")]
    NotFound {
        /// Operation name.
        op: &'static str,
    },

    /// No pooled connection became available.
    #[error("{op}: connection pool exhausted: {source}")]
    Pool {
        /// Operation name.
        op: &'static str,
        /// The underlying pool error.
        source: r2d2::Error,
    },

    /// A statement failed inside the engine.
    #[error("{op}: {source}")]
    Sqlite {
        /// Operation name.
        op: &'static str,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// Committing a batch transaction failed; the batch was rolled back.
    #[error("{op}: commit failed: {source}")]
    Commit {
        /// Operation name.
        op: &'static str,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// The blocking worker running the operation panicked or was aborted.
    #[error("{op}: database worker failed: {source}")]
    Worker {
        /// Operation name.
        op: &'static str,
        /// The join error from the worker task.
        source: tokio::task::JoinError,
    },
}

impl DbError {
    /// Builds the error for an expired or cancelled context.
    pub(crate) fn from_context(op: &'static str, err: ContextError) -> Self {
        match err {
            ContextError::DeadlineExceeded => Self::DeadlineExceeded { op },
            ContextError::Cancelled => Self::Cancelled { op },
        }
    }

    /// Classifies an engine error raised while running `op` under `ctx`.
    ///
    /// `QueryReturnedNoRows` becomes [`DbError::NotFound`]. An interrupted
    /// statement is reported as the context error that triggered the
    /// interrupt.
    pub(crate) fn from_sqlite(op: &'static str, source: rusqlite::Error, ctx: &Context) -> Self {
        if matches!(source, rusqlite::Error::QueryReturnedNoRows) {
            return Self::NotFound { op };
        }
        if source.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
            if let Some(err) = ctx.err() {
                return Self::from_context(op, err);
            }
        }
        Self::Sqlite { op, source }
    }

    /// Returns the operation name, if this error came from one.
    pub fn op(&self) -> Option<&'static str> {
        match self {
            Self::DeadlineExceeded { op }
            | Self::Cancelled { op }
            | Self::NotFound { op }
            | Self::Pool { op, .. }
            | Self::Sqlite { op, .. }
            | Self::Commit { op, .. }
            | Self::Worker { op, .. } => Some(*op),
            Self::Open { .. }
            | Self::PoolInit { .. }
            | Self::DriverNotRegistered(_)
            | Self::Migration(_) => None,
        }
    }

    /// True for errors raised while opening the database.
    pub fn is_open_error(&self) -> bool {
        matches!(
            self,
            Self::Open { .. } | Self::PoolInit { .. } | Self::DriverNotRegistered(_)
        )
    }

    /// True when the operation's deadline expired.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }

    /// True when the operation was cancelled by its caller.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// True when the query matched no rows.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
