//! Open-time behavior: driver selection, pool sizing, migrations.

mod common;

use std::time::Duration;

use common::{open_db, open_db_with_settings};
use lockstep_db::{
    active_driver_name, registration_count, Context, Database, DbRuntimeSettings, Options,
    PoolLimits, DEFAULT_MMAP_SIZE, MIN_OPEN_CONNECTIONS, MMAP_DISABLED_DRIVER, SCHEMA_VERSION,
    STANDARD_DRIVER,
};
use lockstep_observe::SLOW_QUERY_ENV;
use serial_test::serial;

async fn mmap_size(db: &Database) -> i64 {
    db.read(&Context::background(), "mmap_size", |conn| {
        conn.query_row("PRAGMA mmap_size;", [], |row| row.get(0))
    })
    .await
    .expect("should query mmap_size")
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_mmap_selects_custom_driver_and_never_maps() {
    let options = Options { disable_mmap: true };
    let test = open_db(Some(&options));

    assert_eq!(active_driver_name(Some(&options)), MMAP_DISABLED_DRIVER);
    assert_eq!(test.db.driver_name(), MMAP_DISABLED_DRIVER);
    assert_eq!(registration_count(), 1);

    // Check several pooled connections, not just the first one.
    let mut handles = Vec::new();
    let db = std::sync::Arc::new(test.db);
    for _ in 0..8 {
        let db = db.clone();
        handles.push(tokio::spawn(async move { mmap_size(&db).await }));
    }
    for handle in handles {
        assert_eq!(handle.await.expect("task should not panic"), 0);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn default_options_keep_mmap_enabled() {
    let test = open_db(None);
    assert_eq!(test.db.driver_name(), STANDARD_DRIVER);
    assert_eq!(mmap_size(&test.db).await, DEFAULT_MMAP_SIZE);

    let explicit = open_db(Some(&Options { disable_mmap: false }));
    assert_eq!(explicit.db.driver_name(), STANDARD_DRIVER);
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_uses_documented_limits() {
    let test = open_db(None);
    let limits = test.db.pool_limits();

    assert_eq!(limits, PoolLimits::default());
    assert_eq!(limits.max_open(), 25);
    assert_eq!(limits.max_idle(), 10);
    assert!(limits.max_idle() <= limits.max_open());
    assert!(limits.max_open() >= MIN_OPEN_CONNECTIONS);
    assert!(test.db.pool_state().connections <= limits.max_open());
}

#[tokio::test(flavor = "multi_thread")]
async fn custom_pool_limits_are_applied() {
    let settings = DbRuntimeSettings::default().with_pool_limits(PoolLimits::new(12, 4));
    let test = open_db_with_settings(None, settings);

    assert_eq!(test.db.pool_limits().max_open(), 12);
    assert_eq!(test.db.pool_limits().max_idle(), 4);
}

#[test]
#[serial]
fn open_reads_slow_query_threshold_from_environment() {
    std::env::set_var(SLOW_QUERY_ENV, "1");
    let seeded = open_db(None);
    std::env::remove_var(SLOW_QUERY_ENV);
    let unset = open_db(None);

    assert_eq!(
        seeded.db.observer().slow_threshold(),
        Some(Duration::from_millis(1))
    );
    assert_eq!(seeded.db.settings().slow_query_threshold(), Some(Duration::from_millis(1)));
    assert_eq!(unset.db.observer().slow_threshold(), None);
}

#[test]
fn open_in_missing_directory_is_an_open_error() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("missing").join("lockstep.db");

    let err = Database::open(path.to_str().expect("temp path should be utf-8"), None)
        .expect_err("open should fail");
    assert!(err.is_open_error(), "unexpected error: {err:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn reopening_keeps_schema_and_data() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("lockstep.db");
    let path = path.to_str().expect("temp path should be utf-8");

    let first = Database::open(path, None).expect("first open should succeed");
    lockstep_db::metadata::set_metadata(&first, &Context::background(), "k", "v")
        .await
        .expect("set should succeed");
    first.close().await;

    let second = Database::open(path, None).expect("second open should succeed");
    let version: u32 = second
        .read(&Context::background(), "schema_version", |conn| {
            conn.pragma_query_value(None, "user_version", |row| row.get(0))
        })
        .await
        .expect("should read schema version");
    assert_eq!(version, SCHEMA_VERSION);

    let value = lockstep_db::metadata::get_metadata(&second, &Context::background(), "k")
        .await
        .expect("value should survive reopen");
    assert_eq!(value, "v");
}

#[test]
fn concurrent_opens_of_one_file_all_succeed() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("shared.db");
    let path = path.to_str().expect("temp path should be utf-8");

    std::thread::scope(|scope| {
        let openers: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| Database::open(path, None)))
            .collect();
        for opener in openers {
            opener
                .join()
                .expect("opener should not panic")
                .expect("every concurrent open should succeed");
        }
    });
}
