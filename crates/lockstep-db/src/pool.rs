//! Connection pool creation and configuration.

use std::time::Duration;

use lockstep_observe::slow_threshold_from_env;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};

use crate::driver::Driver;
use crate::error::DbError;

/// Default cap on open connections.
pub const DEFAULT_MAX_OPEN_CONNECTIONS: u32 = 25;
/// Default number of idle connections kept warm.
pub const DEFAULT_MAX_IDLE_CONNECTIONS: u32 = 10;
/// Lowest accepted `max_open`; enough for concurrent readers plus a
/// blocked writer.
pub const MIN_OPEN_CONNECTIONS: u32 = 10;

/// Default bound for a single operation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound for operations expected to scan many rows.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(10);
/// Lowest accepted operation timeout.
pub const MIN_OPERATION_TIMEOUT: Duration = Duration::from_millis(100);

/// Idle connections above `max_idle` are closed after this long.
const IDLE_REAP_AFTER: Duration = Duration::from_secs(60);

/// A type alias for the SQLite connection pool.
pub(crate) type DbPool = Pool<SqliteConnectionManager>;

/// A connection checked out of [`DbPool`].
pub(crate) type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

/// Bounds on pooled connections.
///
/// Values are clamped on construction: `max_open` is at least
/// [`MIN_OPEN_CONNECTIONS`] and `max_idle` never exceeds `max_open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    max_open: u32,
    max_idle: u32,
}

impl PoolLimits {
    /// Creates clamped limits.
    pub fn new(max_open: u32, max_idle: u32) -> Self {
        let max_open = max_open.max(MIN_OPEN_CONNECTIONS);
        Self {
            max_open,
            max_idle: max_idle.min(max_open),
        }
    }

    /// Maximum number of open connections.
    pub fn max_open(&self) -> u32 {
        self.max_open
    }

    /// Number of idle connections kept open.
    pub fn max_idle(&self) -> u32 {
        self.max_idle
    }
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OPEN_CONNECTIONS, DEFAULT_MAX_IDLE_CONNECTIONS)
    }
}

/// Runtime tunables for SQLite connection behavior.
///
/// Setters clamp invalid values when they are assigned, so readers of
/// these settings never need to re-validate them. The default slow-query
/// threshold is read from `LOCKSTEP_SLOW_QUERY_MS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    busy_timeout_ms: u64,
    pool: PoolLimits,
    default_timeout: Duration,
    scan_timeout: Duration,
    slow_query_threshold: Option<Duration>,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool: PoolLimits::default(),
            default_timeout: DEFAULT_TIMEOUT,
            scan_timeout: SCAN_TIMEOUT,
            slow_query_threshold: slow_threshold_from_env(),
        }
    }
}

impl DbRuntimeSettings {
    /// Sets the engine busy timeout, in milliseconds.
    pub fn with_busy_timeout_ms(mut self, busy_timeout_ms: u64) -> Self {
        self.busy_timeout_ms = busy_timeout_ms;
        self
    }

    /// Sets the pool limits.
    pub fn with_pool_limits(mut self, pool: PoolLimits) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the default operation timeout, clamped to
    /// [`MIN_OPERATION_TIMEOUT`].
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout.max(MIN_OPERATION_TIMEOUT);
        self
    }

    /// Sets the timeout for many-row scans, clamped to
    /// [`MIN_OPERATION_TIMEOUT`].
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout.max(MIN_OPERATION_TIMEOUT);
        self
    }

    /// Sets the slow-query logging threshold. Zero disables it.
    pub fn with_slow_query_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.slow_query_threshold = threshold.filter(|t| !t.is_zero());
        self
    }

    /// Engine busy timeout, in milliseconds.
    pub fn busy_timeout_ms(&self) -> u64 {
        self.busy_timeout_ms
    }

    /// Pool limits.
    pub fn pool_limits(&self) -> PoolLimits {
        self.pool
    }

    /// Default operation timeout.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Timeout for many-row scans.
    pub fn scan_timeout(&self) -> Duration {
        self.scan_timeout
    }

    /// Slow-query logging threshold.
    pub fn slow_query_threshold(&self) -> Option<Duration> {
        self.slow_query_threshold
    }
}

fn open_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX
}

/// Runs on every new connection: driver hook, busy timeout, WAL mode,
/// foreign keys.
fn init_connection(conn: &Connection, driver: Driver, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    // Busy timeout first so concurrent warm-up connections wait on each
    // other instead of failing while WAL mode is switched on.
    conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
    driver.configure(conn)?;

    // Set WAL mode and verify it was accepted. In-memory databases
    // report "memory" which is expected and acceptable.
    let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    if journal_mode != "wal" && journal_mode != "memory" {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("failed to set WAL journal mode, got: {journal_mode}")),
        ));
    }
    conn.execute_batch("PRAGMA foreign_keys = ON;")
}

/// Creates the SQLite connection pool for `db_path` through `driver`.
///
/// A probe connection is opened first so that a bad path, missing
/// permissions, or a file that is not a database fail immediately with
/// [`DbError::Open`] instead of stalling pool warm-up.
///
/// # Errors
///
/// Returns `DbError::Open` if the probe fails, or `DbError::PoolInit` if
/// the pool cannot be built.
pub(crate) fn create_pool(
    db_path: &str,
    driver: Driver,
    settings: &DbRuntimeSettings,
) -> Result<DbPool, DbError> {
    let busy_timeout_ms = settings.busy_timeout_ms();
    let open_error = |source| DbError::Open {
        path: db_path.to_string(),
        source,
    };

    let probe = Connection::open_with_flags(db_path, open_flags()).map_err(open_error)?;
    init_connection(&probe, driver, busy_timeout_ms).map_err(open_error)?;
    // Forces a read of the file header.
    probe
        .query_row("PRAGMA schema_version;", [], |row| row.get::<_, i64>(0))
        .map_err(open_error)?;
    drop(probe);

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(open_flags())
        .with_init(move |conn| init_connection(conn, driver, busy_timeout_ms));

    let limits = settings.pool_limits();
    let pool = Pool::builder()
        .max_size(limits.max_open())
        .min_idle(Some(limits.max_idle()))
        .idle_timeout(Some(IDLE_REAP_AFTER))
        .connection_timeout(settings.default_timeout())
        .build(manager)
        .map_err(|source| DbError::PoolInit {
            path: db_path.to_string(),
            source,
        })?;

    tracing::info!(
        path = db_path,
        driver = driver.name(),
        max_open = limits.max_open(),
        max_idle = limits.max_idle(),
        "database pool ready"
    );

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn default_limits_leave_room_for_readers_and_a_writer() {
        let limits = PoolLimits::default();
        assert_eq!(limits.max_open(), 25);
        assert_eq!(limits.max_idle(), 10);
        assert!(limits.max_idle() <= limits.max_open());
        assert!(limits.max_open() >= MIN_OPEN_CONNECTIONS);
    }

    #[test]
    fn limits_are_clamped_on_construction() {
        let limits = PoolLimits::new(3, 50);
        assert_eq!(limits.max_open(), MIN_OPEN_CONNECTIONS);
        assert_eq!(limits.max_idle(), MIN_OPEN_CONNECTIONS);

        let limits = PoolLimits::new(40, 60);
        assert_eq!(limits.max_open(), 40);
        assert_eq!(limits.max_idle(), 40);
    }

    #[test]
    fn settings_clamp_timeouts_on_assignment() {
        let settings = DbRuntimeSettings::default()
            .with_default_timeout(Duration::ZERO)
            .with_scan_timeout(Duration::from_millis(1))
            .with_slow_query_threshold(Some(Duration::ZERO));

        assert_eq!(settings.default_timeout(), MIN_OPERATION_TIMEOUT);
        assert_eq!(settings.scan_timeout(), MIN_OPERATION_TIMEOUT);
        assert_eq!(settings.slow_query_threshold(), None);
    }

    #[test]
    fn default_settings_use_documented_timeouts() {
        let settings = DbRuntimeSettings::default();
        assert_eq!(settings.default_timeout(), Duration::from_secs(5));
        assert_eq!(settings.scan_timeout(), Duration::from_secs(10));
        assert_eq!(settings.busy_timeout_ms(), 5_000);
    }

    #[test]
    #[serial]
    fn default_slow_query_threshold_comes_from_environment() {
        std::env::set_var("LOCKSTEP_SLOW_QUERY_MS", "250");
        let seeded = DbRuntimeSettings::default();
        std::env::set_var("LOCKSTEP_SLOW_QUERY_MS", "0");
        let disabled = DbRuntimeSettings::default();
        std::env::remove_var("LOCKSTEP_SLOW_QUERY_MS");
        let unset = DbRuntimeSettings::default();

        assert_eq!(seeded.slow_query_threshold(), Some(Duration::from_millis(250)));
        assert_eq!(disabled.slow_query_threshold(), None);
        assert_eq!(unset.slow_query_threshold(), None);

        // An explicit setting still wins over the environment.
        assert_eq!(seeded.with_slow_query_threshold(None).slow_query_threshold(), None);
    }

    #[test]
    fn create_file_pool() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("pool.db");
        let settings = DbRuntimeSettings::default().with_busy_timeout_ms(2_500);

        let pool = create_pool(
            path.to_str().expect("temp path should be utf-8"),
            Driver::standard(),
            &settings,
        )
        .expect("pool creation should succeed");
        let conn = pool.get().expect("should get a connection");

        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("should query journal_mode");
        assert_eq!(mode, "wal");

        let fk: i32 = conn
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .expect("should query foreign_keys");
        assert_eq!(fk, 1, "foreign keys should be enabled");

        let busy_timeout: i32 = conn
            .query_row("PRAGMA busy_timeout;", [], |row| row.get(0))
            .expect("should query busy_timeout");
        assert_eq!(busy_timeout, 2_500, "busy timeout should match settings");

        assert_eq!(pool.max_size(), 25, "pool max size should match limits");
        assert_eq!(pool.min_idle(), Some(10));
    }

    #[test]
    fn missing_directory_is_an_open_error() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("no-such-dir").join("pool.db");

        let err = create_pool(
            path.to_str().expect("temp path should be utf-8"),
            Driver::standard(),
            &DbRuntimeSettings::default(),
        )
        .expect_err("opening inside a missing directory should fail");
        assert!(matches!(err, DbError::Open { .. }), "unexpected error: {err:?}");
    }

    #[test]
    fn corrupt_file_is_an_open_error() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("corrupt.db");
        std::fs::write(&path, vec![0x5a_u8; 8192]).expect("should write garbage file");

        let err = create_pool(
            path.to_str().expect("temp path should be utf-8"),
            Driver::standard(),
            &DbRuntimeSettings::default(),
        )
        .expect_err("a file that is not a database should fail to open");
        assert!(err.is_open_error(), "unexpected error: {err:?}");
    }
}
