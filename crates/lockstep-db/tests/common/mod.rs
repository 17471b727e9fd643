//! Shared helpers for lockstep-db integration tests.

#![allow(dead_code)]

use lockstep_db::{Context, Database, DbError, DbRuntimeSettings, Options};
use tempfile::TempDir;

/// A database in a temporary directory that is removed on drop.
pub struct TestDb {
    pub db: Database,
    _dir: TempDir,
}

pub fn open_db(options: Option<&Options>) -> TestDb {
    open_db_with_settings(options, DbRuntimeSettings::default())
}

pub fn open_db_with_settings(options: Option<&Options>, settings: DbRuntimeSettings) -> TestDb {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("lockstep.db");
    let db = Database::open_with_settings(
        path.to_str().expect("temp path should be utf-8"),
        options,
        settings,
    )
    .expect("database should open");
    TestDb { db, _dir: dir }
}

/// Creates the `items` table used by the tests.
pub async fn create_items(db: &Database) {
    db.write(&Context::background(), "create_items", |conn| {
        conn.execute_batch(
            "CREATE TABLE items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                label TEXT NOT NULL
            );",
        )
    })
    .await
    .expect("items table should be created");
}

pub async fn count_items(db: &Database) -> Result<i64, DbError> {
    db.read(&Context::background(), "count_items", |conn| {
        conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
    })
    .await
}

/// A query that runs until it is interrupted.
pub const RUNAWAY_QUERY: &str = "WITH RECURSIVE c(x) AS (
        SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 9000000000000
    ) SELECT max(x) FROM c";
