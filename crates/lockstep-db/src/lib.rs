//! Concurrency and resilience layer over an embedded SQLite database.
//!
//! Lets many concurrent readers and writers share one on-disk database
//! without reasoning about locking or driver internals.
//!
//! # Design decisions
//!
//! - **One reader/writer lock per handle**: the engine allows many readers
//!   and one writer. Read-class operations hold the lock shared,
//!   write-class operations hold it exclusive, and each hold is bounded
//!   by a [`Context`] deadline (5 s by default, 10 s for scans).
//! - **Short-hold batches**: a [`BatchTransaction`] takes the exclusive
//!   lock only to start the engine transaction, so long bulk inserts do
//!   not block readers.
//! - **Switchable memory mapping**: the [`MMAP_DISABLED_DRIVER`] turns
//!   memory-mapped I/O off for storage where mapping can fault the
//!   process. It is registered once per process and chosen through
//!   [`Options`].
//! - **`r2d2` connection pool** in WAL mode, bounded at 25 open and 10
//!   idle connections by default.
//! - **Uniform instrumentation**: every operation is observed through
//!   `lockstep-observe`, emitting a count and a latency sample per
//!   operation and outcome.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lockstep_db::{metadata, Context, Database, Options};
//!
//! let db = Database::open("app.db", Some(&Options { disable_mmap: true }))?;
//! let ctx = Context::background();
//!
//! metadata::set_metadata(&db, &ctx, "schema", "v2").await?;
//! let count = db
//!     .read(&ctx, "count_metadata", |conn| {
//!         conn.query_row("SELECT COUNT(*) FROM metadata", [], |row| row.get::<_, i64>(0))
//!     })
//!     .await?;
//! ```

mod batch;
pub mod config;
mod context;
mod database;
mod driver;
mod error;
pub mod metadata;
mod migrations;
mod pool;

pub use batch::BatchTransaction;
pub use config::{init_tracing, load_config, Config, ConfigError, DatabaseConfig, LoggingConfig};
pub use context::{Context, ContextError};
pub use database::{Access, Database, LockedConn};
pub use driver::{
    active_driver_name, lookup_driver, register_driver, registration_count, Driver, Options,
    DEFAULT_MMAP_SIZE, MMAP_DISABLED_DRIVER, STANDARD_DRIVER,
};
pub use error::DbError;
pub use migrations::{run_migrations, MigrationError, SCHEMA_VERSION};
pub use pool::{
    DbRuntimeSettings, PoolLimits, DEFAULT_MAX_IDLE_CONNECTIONS, DEFAULT_MAX_OPEN_CONNECTIONS,
    DEFAULT_TIMEOUT, MIN_OPEN_CONNECTIONS, MIN_OPERATION_TIMEOUT, SCAN_TIMEOUT,
};
