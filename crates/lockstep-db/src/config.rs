//! Configuration loading from file and environment variables.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::driver::Options;
use crate::pool::{
    DbRuntimeSettings, PoolLimits, DEFAULT_MAX_IDLE_CONNECTIONS, DEFAULT_MAX_OPEN_CONNECTIONS,
};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Disable memory-mapped I/O (for network or FUSE-backed storage).
    #[serde(default)]
    pub disable_mmap: bool,

    /// Engine busy timeout, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum open pooled connections.
    #[serde(default = "default_max_open_connections")]
    pub max_open_connections: u32,

    /// Idle pooled connections kept open.
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: u32,

    /// Operations slower than this are logged. Unset or 0 disables it.
    #[serde(default)]
    pub slow_query_ms: Option<u64>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "lockstep_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_db_path() -> String {
    "lockstep.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_max_open_connections() -> u32 {
    DEFAULT_MAX_OPEN_CONNECTIONS
}

fn default_max_idle_connections() -> u32 {
    DEFAULT_MAX_IDLE_CONNECTIONS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            disable_mmap: false,
            busy_timeout_ms: default_busy_timeout_ms(),
            max_open_connections: default_max_open_connections(),
            max_idle_connections: default_max_idle_connections(),
            slow_query_ms: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl DatabaseConfig {
    /// Open options derived from this configuration.
    pub fn options(&self) -> Options {
        Options {
            disable_mmap: self.disable_mmap,
        }
    }

    /// Runtime settings derived from this configuration, clamped.
    pub fn runtime_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings::default()
            .with_busy_timeout_ms(self.busy_timeout_ms)
            .with_pool_limits(PoolLimits::new(
                self.max_open_connections,
                self.max_idle_connections,
            ))
            .with_slow_query_threshold(self.slow_query_ms.map(Duration::from_millis))
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

fn env_flag(raw: &str) -> bool {
    raw == "true" || raw == "1"
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `LOCKSTEP_DB_PATH` overrides `database.path`
/// - `LOCKSTEP_DISABLE_MMAP` overrides `database.disable_mmap` ("true" or "1")
/// - `LOCKSTEP_BUSY_TIMEOUT_MS` overrides `database.busy_timeout_ms`
/// - `LOCKSTEP_MAX_OPEN_CONNECTIONS` overrides `database.max_open_connections`
/// - `LOCKSTEP_MAX_IDLE_CONNECTIONS` overrides `database.max_idle_connections`
/// - `LOCKSTEP_SLOW_QUERY_MS` overrides `database.slow_query_ms`
/// - `LOCKSTEP_LOG_LEVEL` overrides `logging.level`
/// - `LOCKSTEP_LOG_JSON` overrides `logging.json` ("true" or "1")
///
/// Unparsable numeric overrides are ignored.
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(db_path) = std::env::var("LOCKSTEP_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(disable) = std::env::var("LOCKSTEP_DISABLE_MMAP") {
        config.database.disable_mmap = env_flag(&disable);
    }
    if let Ok(ms) = std::env::var("LOCKSTEP_BUSY_TIMEOUT_MS") {
        if let Ok(parsed) = ms.parse() {
            config.database.busy_timeout_ms = parsed;
        }
    }
    if let Ok(max_open) = std::env::var("LOCKSTEP_MAX_OPEN_CONNECTIONS") {
        if let Ok(parsed) = max_open.parse() {
            config.database.max_open_connections = parsed;
        }
    }
    if let Ok(max_idle) = std::env::var("LOCKSTEP_MAX_IDLE_CONNECTIONS") {
        if let Ok(parsed) = max_idle.parse() {
            config.database.max_idle_connections = parsed;
        }
    }
    if let Ok(ms) = std::env::var(lockstep_observe::SLOW_QUERY_ENV) {
        if let Ok(parsed) = ms.parse() {
            config.database.slow_query_ms = Some(parsed);
        }
    }
    if let Ok(level) = std::env::var("LOCKSTEP_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("LOCKSTEP_LOG_JSON") {
        config.logging.json = env_flag(&json);
    }

    Ok(config)
}

/// Installs a global `tracing` subscriber for `logging`.
///
/// An invalid filter falls back to `info`. Returns `false` if a subscriber
/// was already installed, which leaves the existing one in place.
pub fn init_tracing(logging: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_VARS: &[&str] = &[
        "LOCKSTEP_DB_PATH",
        "LOCKSTEP_DISABLE_MMAP",
        "LOCKSTEP_BUSY_TIMEOUT_MS",
        "LOCKSTEP_MAX_OPEN_CONNECTIONS",
        "LOCKSTEP_MAX_IDLE_CONNECTIONS",
        "LOCKSTEP_SLOW_QUERY_MS",
        "LOCKSTEP_LOG_LEVEL",
        "LOCKSTEP_LOG_JSON",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn missing_file_uses_defaults() {
        clear_env();
        let config = load_config(Some("/nonexistent/lockstep.toml")).expect("should fall back");

        assert_eq!(config.database.path, "lockstep.db");
        assert!(!config.database.disable_mmap);
        assert_eq!(config.database.max_open_connections, 25);
        assert_eq!(config.database.max_idle_connections, 10);
        assert_eq!(config.database.slow_query_ms, None);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.database.options(), Options::default());
    }

    #[test]
    #[serial]
    fn file_values_are_parsed() {
        clear_env();
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("lockstep.toml");
        std::fs::write(
            &path,
            r#"
[database]
path = "/srv/data/app.db"
disable_mmap = true
max_open_connections = 40
slow_query_ms = 250

[logging]
level = "debug"
json = true
"#,
        )
        .expect("should write config");

        let config = load_config(path.to_str()).expect("config should parse");
        assert_eq!(config.database.path, "/srv/data/app.db");
        assert!(config.database.options().disable_mmap);
        assert_eq!(config.database.max_idle_connections, 10);
        assert!(config.logging.json);

        let settings = config.database.runtime_settings();
        assert_eq!(settings.pool_limits().max_open(), 40);
        assert_eq!(settings.slow_query_threshold(), Some(Duration::from_millis(250)));
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        clear_env();
        std::env::set_var("LOCKSTEP_DB_PATH", "/tmp/override.db");
        std::env::set_var("LOCKSTEP_DISABLE_MMAP", "1");
        std::env::set_var("LOCKSTEP_SLOW_QUERY_MS", "75");
        std::env::set_var("LOCKSTEP_MAX_OPEN_CONNECTIONS", "not-a-number");

        let config = load_config(None).expect("config should load");
        clear_env();

        assert_eq!(config.database.path, "/tmp/override.db");
        assert!(config.database.disable_mmap);
        assert_eq!(config.database.slow_query_ms, Some(75));
        assert_eq!(config.database.max_open_connections, 25);
    }

    #[test]
    #[serial]
    fn malformed_file_is_a_parse_error() {
        clear_env();
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[database\npath = ").expect("should write config");

        let err = load_config(path.to_str()).expect_err("malformed toml should fail");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn runtime_settings_clamp_pool_limits() {
        let config = DatabaseConfig {
            max_open_connections: 2,
            max_idle_connections: 30,
            slow_query_ms: Some(0),
            ..DatabaseConfig::default()
        };
        let settings = config.runtime_settings();

        assert_eq!(settings.pool_limits().max_open(), 10);
        assert_eq!(settings.pool_limits().max_idle(), 10);
        assert_eq!(settings.slow_query_threshold(), None);
    }
}
