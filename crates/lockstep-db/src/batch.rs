//! Batch transactions: many writes, one commit, a short lock hold.
//!
//! [`Database::begin_batch`] takes the exclusive lock only long enough to
//! start an engine transaction (`BEGIN IMMEDIATE`, which reserves the
//! engine's write lock up front) and releases it before returning. The
//! lock's job is to keep two writers from starting transactions at the
//! same time; once the transaction exists, the engine's own locking
//! governs it, and readers on other connections keep seeing the last
//! committed state.
//!
//! An open batch still holds the engine's write lock, so other writers
//! block at the engine level (up to the busy timeout) until it ends. That
//! is inherent to a single-writer engine. A second `begin_batch` never
//! waits on the engine while holding the lock: it tries `BEGIN IMMEDIATE`
//! without the busy handler, and on `SQLITE_BUSY` releases the lock, backs
//! off, and tries again until its context ends.
//!
//! ```text
//! NotStarted --begin_batch--> Begun --commit------> Committed
//!                                   \--rollback/end(Some)--> RolledBack
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use lockstep_observe::Observation;
use rusqlite::{Connection, ErrorCode, InterruptHandle, Params, Row};
use tokio::task::JoinHandle;

use crate::context::Context;
use crate::database::{run_interruptible, Access, Database};
use crate::error::DbError;
use crate::pool::PooledConn;

/// First wait after `BEGIN IMMEDIATE` finds the engine write lock taken.
const BEGIN_BACKOFF_START: Duration = Duration::from_millis(5);
/// Longest wait between `BEGIN IMMEDIATE` attempts.
const BEGIN_BACKOFF_MAX: Duration = Duration::from_millis(100);

/// An interrupt handle that can be switched off.
///
/// Disarming waits for an interrupt already in progress, so once
/// [`disarm`](Self::disarm) returns no interrupt can reach the connection.
#[derive(Clone)]
struct InterruptGuard(Arc<Mutex<Option<InterruptHandle>>>);

impl InterruptGuard {
    fn new(conn: &Connection) -> Self {
        Self(Arc::new(Mutex::new(Some(conn.get_interrupt_handle()))))
    }

    /// Interrupts the connection unless disarmed. Returns whether it did.
    fn interrupt(&self) -> bool {
        let handle = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match handle.as_ref() {
            Some(handle) => {
                handle.interrupt();
                true
            }
            None => false,
        }
    }

    fn disarm(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// A live, uncommitted engine transaction.
///
/// Owned by the caller that began it and used from one thread at a time.
/// Statements run synchronously in call order; in async code move the
/// batch into `tokio::task::spawn_blocking` (or use
/// [`Database::run_batch`]).
///
/// Ending the batch consumes it. A batch dropped without
/// [`commit`](Self::commit), [`rollback`](Self::rollback), or
/// [`end`](Self::end) is rolled back.
#[must_use = "a batch transaction must be committed or rolled back"]
pub struct BatchTransaction {
    conn: PooledConn,
    op: &'static str,
    ctx: Context,
    interrupt: InterruptGuard,
    watchdog: JoinHandle<()>,
    observation: Option<Observation>,
    finished: bool,
}

impl std::fmt::Debug for BatchTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchTransaction")
            .field("op", &self.op)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl BatchTransaction {
    fn new(conn: PooledConn, op: &'static str, ctx: Context, observation: Observation) -> Self {
        // Interrupts in-flight statements once the caller's context ends.
        let interrupt = InterruptGuard::new(&conn);
        let watch = ctx.clone();
        let armed = interrupt.clone();
        let watchdog = tokio::spawn(async move {
            let reason = watch.done().await;
            if armed.interrupt() {
                tracing::debug!(op, reason = %reason, "interrupted batch transaction");
            }
        });

        Self {
            conn,
            op,
            ctx,
            interrupt,
            watchdog,
            observation: Some(observation),
            finished: false,
        }
    }

    /// Operation name this batch reports under.
    pub fn op(&self) -> &'static str {
        self.op
    }

    /// The caller's context the batch is bound to.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    fn check_live(&self) -> Result<(), DbError> {
        match self.ctx.err() {
            Some(err) => Err(DbError::from_context(self.op, err)),
            None => Ok(()),
        }
    }

    fn classify(&self, source: rusqlite::Error) -> DbError {
        DbError::from_sqlite(self.op, source, &self.ctx)
    }

    /// Executes one statement inside the transaction.
    ///
    /// # Errors
    ///
    /// `DeadlineExceeded`/`Cancelled` if the caller's context is done,
    /// otherwise `Sqlite`.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize, DbError> {
        self.check_live()?;
        self.conn.execute(sql, params).map_err(|e| self.classify(e))
    }

    /// Executes a cached prepared statement; preferred for repeated
    /// inserts inside one batch.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub fn execute_cached<P: Params>(&self, sql: &str, params: P) -> Result<usize, DbError> {
        self.check_live()?;
        self.conn
            .prepare_cached(sql)
            .and_then(|mut stmt| stmt.execute(params))
            .map_err(|e| self.classify(e))
    }

    /// Executes several parameterless statements.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub fn execute_batch(&self, sql: &str) -> Result<(), DbError> {
        self.check_live()?;
        self.conn.execute_batch(sql).map_err(|e| self.classify(e))
    }

    /// Runs a single-row query inside the transaction, so the batch sees
    /// its own uncommitted writes.
    ///
    /// # Errors
    ///
    /// `NotFound` when no row matches, otherwise as
    /// [`execute`](Self::execute).
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<T, DbError>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.check_live()?;
        self.conn.query_row(sql, params, f).map_err(|e| self.classify(e))
    }

    /// Gives `f` the transaction's connection for anything the helpers
    /// above do not cover.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub fn with_conn<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        self.check_live()?;
        f(&self.conn).map_err(|e| self.classify(e))
    }

    /// Commits the batch.
    ///
    /// If `COMMIT` fails the engine may leave the transaction open; it is
    /// rolled back before the commit error is returned.
    ///
    /// # Errors
    ///
    /// `Commit` with the engine's error.
    pub fn commit(mut self) -> Result<(), DbError> {
        self.finished = true;
        let result = self.conn.execute_batch("COMMIT;").map_err(|source| {
            if !self.conn.is_autocommit() {
                if let Err(rollback_err) = self.conn.execute_batch("ROLLBACK;") {
                    tracing::warn!(
                        op = self.op,
                        error = %rollback_err,
                        "rollback after failed commit also failed"
                    );
                }
            }
            DbError::Commit { op: self.op, source }
        });
        self.finish_observation(&result);
        if result.is_ok() {
            tracing::debug!(op = self.op, "batch transaction committed");
        }
        result
    }

    /// Rolls the batch back.
    ///
    /// # Errors
    ///
    /// `Sqlite` if the engine rejects the rollback.
    pub fn rollback(mut self) -> Result<(), DbError> {
        self.finished = true;
        // The engine already ended the transaction after some errors.
        let result = if self.conn.is_autocommit() {
            Ok(())
        } else {
            self.conn
                .execute_batch("ROLLBACK;")
                .map_err(|source| DbError::Sqlite { op: self.op, source })
        };
        // A rolled-back batch is a failed unit of work.
        self.finish_observation(&Err::<(), ()>(()));
        tracing::debug!(op = self.op, "batch transaction rolled back");
        result
    }

    /// Ends the batch: commits when `cause` is `None`, otherwise rolls back
    /// and returns `cause`.
    ///
    /// A rollback failure on the error path is logged and never replaces
    /// `cause`.
    ///
    /// # Errors
    ///
    /// `cause` itself, or `Commit` if committing fails.
    pub fn end(self, cause: Option<DbError>) -> Result<(), DbError> {
        match cause {
            None => self.commit(),
            Some(cause) => Err(self.abort(cause)),
        }
    }

    fn abort(self, cause: DbError) -> DbError {
        let op = self.op;
        if let Err(rollback_err) = self.rollback() {
            tracing::warn!(
                op,
                error = %rollback_err,
                cause = %cause,
                "rollback failed while aborting batch"
            );
        }
        cause
    }

    fn finish_observation<T, E>(&mut self, result: &Result<T, E>) {
        if let Some(observation) = self.observation.take() {
            observation.finish(result);
        }
    }
}

impl Drop for BatchTransaction {
    fn drop(&mut self) {
        // The connection returns to the pool after this; nothing may
        // interrupt it from here on.
        self.interrupt.disarm();
        self.watchdog.abort();
        if self.finished || self.conn.is_autocommit() {
            return;
        }
        tracing::warn!(op = self.op, "batch transaction dropped without ending; rolling back");
        if let Err(err) = self.conn.execute_batch("ROLLBACK;") {
            tracing::warn!(op = self.op, error = %err, "rollback of dropped batch failed");
        }
    }
}

/// Starts an immediate transaction without waiting in the busy handler.
/// Returns `false` when another connection holds the engine write lock.
fn try_begin_immediate(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<bool> {
    conn.busy_timeout(Duration::ZERO)?;
    let begun = conn.execute_batch("BEGIN IMMEDIATE;");
    conn.busy_timeout(busy_timeout)?;

    match begun {
        Ok(()) => Ok(true),
        Err(err) if err.sqlite_error_code() == Some(ErrorCode::DatabaseBusy) => Ok(false),
        Err(err) => Err(err),
    }
}

impl Database {
    /// Begins a batch transaction.
    ///
    /// The exclusive lock is held only while the engine transaction is
    /// started. `ctx` stays attached to the batch: when it is cancelled or
    /// its deadline passes, in-flight statements are interrupted and later
    /// ones fail.
    ///
    /// # Errors
    ///
    /// `DeadlineExceeded`/`Cancelled` if the lock, a connection, or the
    /// engine's write lock cannot be had within the default timeout, and
    /// `Pool`/`Sqlite`/`Worker` for other failures.
    pub async fn begin_batch(&self, ctx: &Context, op: &'static str) -> Result<BatchTransaction, DbError> {
        let observation = self.observer().observe(op);
        match self.begin_locked(ctx, op).await {
            Ok(conn) => {
                tracing::debug!(op, "batch transaction begun; lock released");
                Ok(BatchTransaction::new(conn, op, ctx.clone(), observation))
            }
            Err(err) => {
                observation.finish(&Err::<(), _>(&err));
                Err(err)
            }
        }
    }

    async fn begin_locked(&self, ctx: &Context, op: &'static str) -> Result<PooledConn, DbError> {
        let begin_ctx = ctx.with_timeout(self.settings().default_timeout());
        let busy_timeout = Duration::from_millis(self.settings().busy_timeout_ms());
        let mut backoff = BEGIN_BACKOFF_START;
        let mut spare = None;

        loop {
            if let Some(err) = begin_ctx.err() {
                return Err(DbError::from_context(op, err));
            }

            let held = self.acquire(&begin_ctx, op, Access::Exclusive).await?;
            let conn = match spare.take() {
                Some(conn) => conn,
                None => self.checkout(&begin_ctx, op).await?,
            };
            let (conn, begun) = run_interruptible(&begin_ctx, op, conn, move |conn| {
                try_begin_immediate(conn, busy_timeout)
            })
            .await?;
            drop(held);

            if begun {
                return Ok(conn);
            }
            spare = Some(conn);

            tracing::debug!(
                op,
                backoff_ms = backoff.as_millis() as u64,
                "engine write lock held by another batch; retrying"
            );
            tokio::select! {
                biased;
                err = begin_ctx.done() => return Err(DbError::from_context(op, err)),
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(BEGIN_BACKOFF_MAX);
        }
    }

    /// Runs `f` inside a batch: begins, runs `f` on a blocking thread, then
    /// commits on `Ok` or rolls back on `Err`.
    ///
    /// # Errors
    ///
    /// Whatever [`begin_batch`](Self::begin_batch) or `f` returns, or
    /// `Commit`.
    pub async fn run_batch<T, F>(&self, ctx: &Context, op: &'static str, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&BatchTransaction) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        let batch = self.begin_batch(ctx, op).await?;
        tokio::task::spawn_blocking(move || match f(&batch) {
            Ok(value) => batch.commit().map(|()| value),
            Err(cause) => Err(batch.abort(cause)),
        })
        .await
        .map_err(|source| DbError::Worker { op, source })?
    }
}
