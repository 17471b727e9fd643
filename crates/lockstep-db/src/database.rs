//! The lock-guarded database handle.
//!
//! SQLite allows many readers but a single writer. [`Database`] pairs the
//! connection pool with one process-level reader/writer lock: read-class
//! operations hold it shared, write-class operations hold it exclusive,
//! and each hold lasts only as long as the operation's closure runs.
//!
//! Every operation:
//!
//! 1. starts an [`Observation`](lockstep_observe::Observation),
//! 2. derives a bounded child of the caller's [`Context`],
//! 3. waits for the lock and a pooled connection, giving up when the
//!    context is done,
//! 4. runs the closure on a blocking thread that owns the lock guard, so
//!    the lock is released on every exit path,
//! 5. interrupts the running statement if the context expires or is
//!    cancelled first.
//!
//! Closures receive a [`LockedConn`], which only this crate can create.
//! Helpers that take `&LockedConn` are the "already locked" variants: they
//! run inside an operation that holds the lock and never try to take it
//! again.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use lockstep_observe::QueryObserver;
use rusqlite::Connection;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::context::Context;
use crate::driver::{active_driver_name, lookup_driver, register_driver, Driver, Options};
use crate::error::DbError;
use crate::migrations::run_migrations;
use crate::pool::{create_pool, DbPool, DbRuntimeSettings, PoolLimits, PooledConn};

/// How an operation holds the database lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Shared with other readers.
    Shared,
    /// Exclusive; no other reader or writer holds the lock.
    Exclusive,
}

impl Access {
    /// Returns the log label for this access mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
        }
    }
}

/// A held lock guard, moved into the blocking worker.
#[derive(Debug)]
pub(crate) enum HeldLock {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// A connection borrowed while the database lock is held.
///
/// Dereferences to [`rusqlite::Connection`]. Only this crate constructs
/// it, so holding one proves the caller is inside a locked operation.
pub struct LockedConn<'a> {
    conn: &'a Connection,
    access: Access,
}

impl<'a> LockedConn<'a> {
    pub(crate) fn new(conn: &'a Connection, access: Access) -> Self {
        Self { conn, access }
    }

    /// The mode the lock is held in.
    pub fn access(&self) -> Access {
        self.access
    }
}

impl Deref for LockedConn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

/// The process-wide database handle.
///
/// Open one per database file. The pool is private: every statement goes
/// through [`read`](Self::read), [`write`](Self::write), or a
/// [`BatchTransaction`](crate::BatchTransaction).
pub struct Database {
    pool: DbPool,
    lock: Arc<RwLock<()>>,
    observer: QueryObserver,
    settings: DbRuntimeSettings,
    driver: Driver,
    path: String,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("driver", &self.driver.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Opens `path` with default runtime settings.
    ///
    /// Blocks while the pool warms up and migrations run; call it during
    /// startup or from a blocking task.
    ///
    /// # Errors
    ///
    /// Returns an open error (`Open`, `PoolInit`, `DriverNotRegistered`)
    /// or `Migration` if the schema cannot be brought up to date.
    pub fn open(path: &str, options: Option<&Options>) -> Result<Self, DbError> {
        Self::open_with_settings(path, options, DbRuntimeSettings::default())
    }

    /// Opens `path` with explicit runtime settings.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn open_with_settings(
        path: &str,
        options: Option<&Options>,
        settings: DbRuntimeSettings,
    ) -> Result<Self, DbError> {
        register_driver();
        let name = active_driver_name(options);
        let driver = lookup_driver(name).ok_or(DbError::DriverNotRegistered(name))?;

        let pool = create_pool(path, driver, &settings)?;
        let observer = QueryObserver::new(settings.slow_query_threshold());

        {
            // This handle is not shared yet. Other handles on the same file
            // are serialized by the engine write lock each step takes.
            let conn = pool.get().map_err(|source| DbError::PoolInit {
                path: path.to_string(),
                source,
            })?;
            let applied = run_migrations(&conn, &observer)?;
            if applied > 0 {
                tracing::info!(steps = applied, path, "database schema upgraded");
            }
        }

        Ok(Self {
            pool,
            lock: Arc::new(RwLock::new(())),
            observer,
            settings,
            driver,
            path: path.to_string(),
        })
    }

    /// Path this handle was opened on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Name of the driver selected at open.
    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    /// Runtime settings in effect.
    pub fn settings(&self) -> &DbRuntimeSettings {
        &self.settings
    }

    /// Configured pool limits.
    pub fn pool_limits(&self) -> PoolLimits {
        self.settings.pool_limits()
    }

    /// Current pool occupancy.
    pub fn pool_state(&self) -> r2d2::State {
        self.pool.state()
    }

    /// The instrumentation observer used by this handle.
    pub fn observer(&self) -> &QueryObserver {
        &self.observer
    }

    /// Runs a read-class operation under the shared lock with the default
    /// timeout.
    ///
    /// # Errors
    ///
    /// `DeadlineExceeded` or `Cancelled` when the context ends first,
    /// `NotFound` when the closure's query matched no rows, and `Pool`,
    /// `Sqlite`, or `Worker` for other failures.
    pub async fn read<T, F>(&self, ctx: &Context, op: &'static str, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&LockedConn<'_>) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run(ctx, op, Access::Shared, self.settings.default_timeout(), f)
            .await
    }

    /// Runs a read-class operation under the shared lock, bounded by
    /// `timeout` (use [`SCAN_TIMEOUT`](crate::SCAN_TIMEOUT) for many-row
    /// scans).
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read).
    pub async fn read_with_timeout<T, F>(
        &self,
        ctx: &Context,
        op: &'static str,
        timeout: Duration,
        f: F,
    ) -> Result<T, DbError>
    where
        F: FnOnce(&LockedConn<'_>) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run(ctx, op, Access::Shared, timeout, f).await
    }

    /// Runs a write-class operation under the exclusive lock with the
    /// default timeout.
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read).
    pub async fn write<T, F>(&self, ctx: &Context, op: &'static str, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&LockedConn<'_>) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run(ctx, op, Access::Exclusive, self.settings.default_timeout(), f)
            .await
    }

    /// Runs a write-class operation under the exclusive lock, bounded by
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read).
    pub async fn write_with_timeout<T, F>(
        &self,
        ctx: &Context,
        op: &'static str,
        timeout: Duration,
        f: F,
    ) -> Result<T, DbError>
    where
        F: FnOnce(&LockedConn<'_>) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run(ctx, op, Access::Exclusive, timeout, f).await
    }

    async fn run<T, F>(
        &self,
        ctx: &Context,
        op: &'static str,
        access: Access,
        timeout: Duration,
        f: F,
    ) -> Result<T, DbError>
    where
        F: FnOnce(&LockedConn<'_>) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let observation = self.observer.observe(op);
        let result = self.run_locked(ctx, op, access, timeout, f).await;
        observation.finish(&result);
        result
    }

    async fn run_locked<T, F>(
        &self,
        ctx: &Context,
        op: &'static str,
        access: Access,
        timeout: Duration,
        f: F,
    ) -> Result<T, DbError>
    where
        F: FnOnce(&LockedConn<'_>) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let ctx = ctx.with_timeout(timeout);
        if let Some(err) = ctx.err() {
            return Err(DbError::from_context(op, err));
        }

        let held = self.acquire(&ctx, op, access).await?;
        let conn = self.checkout(&ctx, op).await?;

        let (_conn, value) = run_interruptible(&ctx, op, conn, move |conn| {
            let _held = held;
            f(&LockedConn::new(conn, access))
        })
        .await?;
        Ok(value)
    }

    /// Waits for the lock in `access` mode until `ctx` is done.
    pub(crate) async fn acquire(
        &self,
        ctx: &Context,
        op: &'static str,
        access: Access,
    ) -> Result<HeldLock, DbError> {
        let lock = Arc::clone(&self.lock);
        let acquire = async move {
            match access {
                Access::Shared => HeldLock::Shared(lock.read_owned().await),
                Access::Exclusive => HeldLock::Exclusive(lock.write_owned().await),
            }
        };

        tokio::select! {
            biased;
            held = acquire => Ok(held),
            err = ctx.done() => {
                tracing::warn!(op, access = access.as_str(), reason = %err, "gave up waiting for database lock");
                Err(DbError::from_context(op, err))
            }
        }
    }

    /// Checks a connection out of the pool, giving up as soon as `ctx` is
    /// done.
    ///
    /// A checkout abandoned this way finishes on its blocking thread and
    /// the connection goes straight back to the pool.
    pub(crate) async fn checkout(&self, ctx: &Context, op: &'static str) -> Result<PooledConn, DbError> {
        let pool = self.pool.clone();
        let wait = ctx.remaining().unwrap_or(self.settings.default_timeout());
        let mut checkout = tokio::task::spawn_blocking(move || pool.get_timeout(wait));

        let checked_out = tokio::select! {
            biased;
            joined = &mut checkout => joined.map_err(|source| DbError::Worker { op, source })?,
            err = ctx.done() => {
                tracing::warn!(op, reason = %err, "gave up waiting for a pooled connection");
                return Err(DbError::from_context(op, err));
            }
        };

        checked_out.map_err(|source| match ctx.err() {
            Some(err) => DbError::from_context(op, err),
            None => DbError::Pool { op, source },
        })
    }

    /// Closes the handle once every in-flight operation has released the
    /// lock. Open batch transactions keep their own connections until
    /// they end.
    pub async fn close(self) {
        let _exclusive = self.lock.write().await;
        tracing::info!(path = %self.path, "closing database");
        drop(self.pool);
    }
}

/// Runs `f` against `conn` on a blocking thread, interrupting the engine
/// if `ctx` finishes first.
///
/// Always waits for the worker to return, so anything `f` owns (the lock
/// guard in particular) is released before this resolves. The connection
/// is handed back rather than dropped on the worker, so it cannot return
/// to the pool while an interrupt aimed at this operation is still
/// possible.
pub(crate) async fn run_interruptible<T, F>(
    ctx: &Context,
    op: &'static str,
    conn: PooledConn,
    f: F,
) -> Result<(PooledConn, T), DbError>
where
    F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let interrupt = conn.get_interrupt_handle();
    let mut worker = tokio::task::spawn_blocking(move || {
        let result = f(&conn);
        (conn, result)
    });

    let joined = tokio::select! {
        biased;
        joined = &mut worker => joined,
        reason = ctx.done() => {
            tracing::debug!(op, reason = %reason, "interrupting in-flight statement");
            interrupt.interrupt();
            worker.await
        }
    };

    let (conn, result) = joined.map_err(|source| DbError::Worker { op, source })?;
    match result {
        Ok(value) => Ok((conn, value)),
        Err(source) => Err(DbError::from_sqlite(op, source, ctx)),
    }
}
