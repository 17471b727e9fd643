//! Versioned schema upgrades.
//!
//! The schema version is kept in `PRAGMA user_version`; step `n` of
//! [`STEPS`] moves the database from version `n - 1` to `n`. Each step runs
//! in its own `BEGIN IMMEDIATE` transaction and re-reads the version after
//! taking the engine's write lock, so handles opened concurrently on one
//! file apply every step exactly once. Steps are reported through the
//! handle's [`QueryObserver`] under the `schema_upgrade` operation.

use lockstep_observe::QueryObserver;
use rusqlite::Connection;
use thiserror::Error;

/// Schema steps in order. Append only.
const STEPS: &[&str] = &[include_str!("schema/v1_metadata.sql")];

/// Schema version this build brings databases up to.
pub const SCHEMA_VERSION: u32 = STEPS.len() as u32;

/// Errors raised while bringing the schema up to date.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A step failed and was rolled back.
    #[error("schema upgrade to version {version} failed: {source}")]
    Step {
        /// Version the failed step would have produced.
        version: u32,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// The file was written by a newer build.
    #[error("database schema version {found} is newer than supported version {supported}")]
    TooNew {
        /// Version found in the file.
        found: u32,
        /// Highest version this build knows.
        supported: u32,
    },
}

/// Brings `conn`'s database up to [`SCHEMA_VERSION`] and returns how many
/// steps this call applied.
///
/// # Errors
///
/// Returns `MigrationError` if a step fails or the file is newer than
/// this build.
pub fn run_migrations(conn: &Connection, observer: &QueryObserver) -> Result<usize, MigrationError> {
    upgrade(conn, observer, STEPS)
}

fn upgrade(conn: &Connection, observer: &QueryObserver, steps: &[&str]) -> Result<usize, MigrationError> {
    let supported = steps.len() as u32;
    let mut applied = 0;

    for (version, sql) in (1..).zip(steps) {
        let observation = observer.observe("schema_upgrade");
        let result = apply_step(conn, version, supported, sql);
        observation.finish(&result);

        if result? {
            tracing::info!(version, "schema upgraded");
            applied += 1;
        }
    }

    Ok(applied)
}

/// Applies one step in its own transaction. `Ok(false)` means the
/// database was already at or past `version`.
fn apply_step(conn: &Connection, version: u32, supported: u32, sql: &str) -> Result<bool, MigrationError> {
    let failed = move |source| MigrationError::Step { version, source };

    conn.execute_batch("BEGIN IMMEDIATE;").map_err(failed)?;
    let outcome = step_in_transaction(conn, version, supported, sql)
        .and_then(|changed| conn.execute_batch("COMMIT;").map(|()| changed).map_err(failed));

    if outcome.is_err() && !conn.is_autocommit() {
        if let Err(err) = conn.execute_batch("ROLLBACK;") {
            tracing::warn!(version, error = %err, "rollback of failed schema step failed");
        }
    }
    outcome
}

fn step_in_transaction(
    conn: &Connection,
    version: u32,
    supported: u32,
    sql: &str,
) -> Result<bool, MigrationError> {
    let failed = move |source| MigrationError::Step { version, source };

    let current: u32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(failed)?;
    if current > supported {
        return Err(MigrationError::TooNew {
            found: current,
            supported,
        });
    }
    if current >= version {
        return Ok(false);
    }

    conn.execute_batch(sql).map_err(failed)?;
    conn.pragma_update(None, "user_version", version).map_err(failed)?;
    Ok(true)
}
