//! Named connection drivers and their one-time registration.
//!
//! Memory-mapped reads can fault the process (SIGBUS) when the database
//! file lives on storage that misbehaves under mmap, such as network or
//! FUSE mounts. The [`MMAP_DISABLED_DRIVER`] variant turns mapping off on
//! every connection it configures. It is registered next to the built-in
//! [`STANDARD_DRIVER`] by [`register_driver`], and [`active_driver_name`]
//! picks one from [`Options`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Once, PoisonError, RwLock};

use rusqlite::{Connection, OptionalExtension};

/// Name of the standard driver, with memory-mapped I/O enabled.
pub const STANDARD_DRIVER: &str = "sqlite3";

/// Name of the driver variant with memory-mapped I/O disabled.
pub const MMAP_DISABLED_DRIVER: &str = "sqlite3-mmap-disabled";

/// Mapping size applied by the standard driver (256 MiB).
pub const DEFAULT_MMAP_SIZE: i64 = 268_435_456;

static REGISTER: Once = Once::new();
static REGISTRATIONS: AtomicUsize = AtomicUsize::new(0);
static REGISTRY: RwLock<BTreeMap<&'static str, Driver>> = RwLock::new(BTreeMap::new());

/// Options consumed when a database is opened.
///
/// `None` and `Options::default()` both mean memory-mapped I/O stays
/// enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// Disable memory-mapped I/O on every connection.
    pub disable_mmap: bool,
}

/// Per-connection setup for one named driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Driver {
    name: &'static str,
    mmap_size: i64,
}

impl Driver {
    /// The built-in driver.
    pub const fn standard() -> Self {
        Self {
            name: STANDARD_DRIVER,
            mmap_size: DEFAULT_MMAP_SIZE,
        }
    }

    const fn mmap_disabled() -> Self {
        Self {
            name: MMAP_DISABLED_DRIVER,
            mmap_size: 0,
        }
    }

    /// The registered name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True when this driver turns memory-mapped I/O off.
    pub fn disables_mmap(&self) -> bool {
        self.mmap_size == 0
    }

    /// Applies the driver's settings to a freshly opened connection.
    ///
    /// In-memory databases do not support mapping and report no value;
    /// that is accepted. For file databases the mmap-disabled driver
    /// verifies the engine reports a mapping size of zero.
    ///
    /// # Errors
    ///
    /// Returns the engine error if the pragma fails, or a `SQLITE_ERROR`
    /// failure if mapping could not be disabled.
    pub fn configure(&self, conn: &Connection) -> rusqlite::Result<()> {
        let applied: Option<i64> = conn
            .query_row(&format!("PRAGMA mmap_size = {};", self.mmap_size), [], |row| {
                row.get(0)
            })
            .optional()?;

        if let Some(applied) = applied {
            if self.disables_mmap() && applied != 0 {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                    Some(format!(
                        "failed to disable memory-mapped I/O, mmap_size is {applied}"
                    )),
                ));
            }
        }
        Ok(())
    }
}

/// Registers the mmap-disabled driver.
///
/// Safe to call any number of times from any thread; the registration
/// body runs once per process.
pub fn register_driver() {
    REGISTER.call_once(|| {
        let driver = Driver::mmap_disabled();
        REGISTRY
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(driver.name, driver);
        REGISTRATIONS.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(driver = driver.name, "registered database driver");
    });
}

/// Number of times the registration body has run in this process.
///
/// Always 0 before the first [`register_driver`] call and 1 afterwards.
pub fn registration_count() -> usize {
    REGISTRATIONS.load(Ordering::SeqCst)
}

/// Looks up a driver by name.
///
/// The standard driver is always available; other drivers exist only
/// after [`register_driver`].
pub fn lookup_driver(name: &str) -> Option<Driver> {
    if name == STANDARD_DRIVER {
        return Some(Driver::standard());
    }
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .copied()
}

/// Picks the driver name for the given options.
pub fn active_driver_name(options: Option<&Options>) -> &'static str {
    match options {
        Some(Options { disable_mmap: true }) => MMAP_DISABLED_DRIVER,
        _ => STANDARD_DRIVER,
    }
}
