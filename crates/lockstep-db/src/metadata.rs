//! Key/value metadata store.
//!
//! Each public function is one lock-guarded operation. The `*_locked`
//! helpers take a [`LockedConn`] and are for use inside an operation that
//! already holds the lock.

use rusqlite::{params, OptionalExtension};

use crate::context::Context;
use crate::database::{Database, LockedConn};
use crate::error::DbError;
use crate::pool::SCAN_TIMEOUT;

/// Reads `key` while the lock is already held.
///
/// # Errors
///
/// `QueryReturnedNoRows` when the key is absent.
pub fn get_metadata_locked(conn: &LockedConn<'_>, key: &str) -> rusqlite::Result<String> {
    conn.query_row(
        "SELECT value FROM metadata WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
}

/// Returns the value stored under `key`.
///
/// # Errors
///
/// `NotFound` when the key is absent; an empty stored value is returned
/// as `Ok("")`.
pub async fn get_metadata(db: &Database, ctx: &Context, key: &str) -> Result<String, DbError> {
    let key = key.to_string();
    db.read(ctx, "get_metadata", move |conn| get_metadata_locked(conn, &key))
        .await
}

/// Stores `value` under `key`, replacing any existing value.
///
/// # Errors
///
/// Returns the operation error on failure.
pub async fn set_metadata(db: &Database, ctx: &Context, key: &str, value: &str) -> Result<(), DbError> {
    let (key, value) = (key.to_string(), value.to_string());
    db.write(ctx, "set_metadata", move |conn| {
        upsert_locked(conn, &key, &value).map(|_| ())
    })
    .await
}

fn upsert_locked(conn: &rusqlite::Connection, key: &str, value: &str) -> rusqlite::Result<usize> {
    conn.prepare_cached(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
    )?
    .execute(params![key, value])
}

/// Stores `value` under `key` only if the key is absent. Returns `true`
/// when the value was written.
///
/// # Errors
///
/// Returns the operation error on failure.
pub async fn set_metadata_if_absent(
    db: &Database,
    ctx: &Context,
    key: &str,
    value: &str,
) -> Result<bool, DbError> {
    let (key, value) = (key.to_string(), value.to_string());
    db.write(ctx, "set_metadata_if_absent", move |conn| {
        if get_metadata_locked(conn, &key).optional()?.is_some() {
            return Ok(false);
        }
        upsert_locked(conn, &key, &value)?;
        Ok(true)
    })
    .await
}

/// Removes `key`. Returns `true` when a row was deleted.
///
/// # Errors
///
/// Returns the operation error on failure.
pub async fn delete_metadata(db: &Database, ctx: &Context, key: &str) -> Result<bool, DbError> {
    let key = key.to_string();
    db.write(ctx, "delete_metadata", move |conn| {
        conn.execute("DELETE FROM metadata WHERE key = ?1", params![key])
            .map(|deleted| deleted > 0)
    })
    .await
}

/// Lists every entry ordered by key. Uses the scan timeout.
///
/// # Errors
///
/// Returns the operation error on failure.
pub async fn list_metadata(db: &Database, ctx: &Context) -> Result<Vec<(String, String)>, DbError> {
    db.read_with_timeout(ctx, "list_metadata", SCAN_TIMEOUT, |conn| {
        let mut stmt = conn.prepare("SELECT key, value FROM metadata ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    })
    .await
}

/// Upserts many entries in one batch transaction. Returns the number of
/// entries written.
///
/// # Errors
///
/// Returns the first failing statement's error; nothing from the batch
/// is kept in that case.
pub async fn put_metadata_batch(
    db: &Database,
    ctx: &Context,
    entries: Vec<(String, String)>,
) -> Result<usize, DbError> {
    db.run_batch(ctx, "put_metadata_batch", move |batch| {
        for (key, value) in &entries {
            batch.with_conn(|conn| upsert_locked(conn, key, value))?;
        }
        Ok(entries.len())
    })
    .await
}
