//! Engine configuration loaded from TOML.
//!
//! Every field is optional in the file; missing fields take the defaults
//! below. Values are range-checked by [`EngineConfig::validate`] before the
//! engine is assembled.
//!
//! ```toml
//! destination_dir = "/srv/downloads"
//! max_concurrent = 4
//!
//! [retry]
//! max_attempts = 6
//! base_delay_ms = 500
//! ```

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::db::DatabaseOptions;
use crate::events::DEFAULT_PROGRESS_CAPACITY;
use crate::fetch::{
    DEFAULT_CHECKPOINT_BYTES, DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_CHUNK_SIZE,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_STALL_TIMEOUT, FetchOptions,
};
use crate::retry::{
    DEFAULT_BASE_DELAY, DEFAULT_JITTER, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY, RetryPolicy,
};
use crate::scheduler::{DEFAULT_MAX_CONCURRENT, MAX_CONCURRENT_LIMIT};

const APP_DIR: &str = "transfer-manager";
const CONFIG_FILE: &str = "config.toml";
const DATABASE_FILE: &str = "transfers.db";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file '{}': {source}", .path.display())]
    Read {
        /// Config file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`EngineConfig`].
    #[error("failed to parse {origin}: {source}")]
    Parse {
        /// What was parsed, e.g. the file path.
        origin: String,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },

    /// A value is outside its accepted range.
    #[error("invalid config value for `{field}`: {value}. Expected range: {expected}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// Offending value.
        value: String,
        /// Accepted range.
        expected: &'static str,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, value: impl ToString, expected: &'static str) -> Self {
        Self::Invalid {
            field,
            value: value.to_string(),
            expected,
        }
    }
}

/// Retry tunables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts before a failure is terminal, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on the exponential delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Upper bound on random jitter added to each delay, in milliseconds.
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: duration_millis(DEFAULT_BASE_DELAY),
            max_delay_ms: duration_millis(DEFAULT_MAX_DELAY),
            jitter_ms: duration_millis(DEFAULT_JITTER),
        }
    }
}

/// Everything [`Engine::open`](crate::Engine::open) needs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Directory new transfers are written to. Created if missing.
    pub destination_dir: PathBuf,
    /// `SQLite` database file.
    pub database_path: PathBuf,
    /// Maximum transfers fetched at once.
    pub max_concurrent: usize,
    /// Bytes per disk write.
    pub chunk_size: usize,
    /// Maximum milliseconds between progress checkpoints.
    pub checkpoint_interval_ms: u64,
    /// Maximum bytes written between progress checkpoints.
    pub checkpoint_bytes: u64,
    /// Seconds without data before a connection counts as stalled.
    pub stall_timeout_secs: u64,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Progress events buffered per subscriber.
    pub progress_capacity: usize,
    /// Database pool size.
    pub db_max_connections: u32,
    /// Database busy timeout in milliseconds.
    pub db_busy_timeout_ms: u32,
    /// Retry tunables.
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let db = DatabaseOptions::default();
        Self {
            destination_dir: PathBuf::from("."),
            database_path: default_database_path(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            checkpoint_interval_ms: duration_millis(DEFAULT_CHECKPOINT_INTERVAL),
            checkpoint_bytes: DEFAULT_CHECKPOINT_BYTES,
            stall_timeout_secs: DEFAULT_STALL_TIMEOUT.as_secs(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            progress_capacity: DEFAULT_PROGRESS_CAPACITY,
            db_max_connections: db.max_connections,
            db_busy_timeout_ms: db.busy_timeout_ms,
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses a TOML document. Does not validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            origin: "config".to_string(),
            source,
        })
    }

    /// Reads, parses and validates a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file is unreadable, malformed or invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            origin: format!("config file '{}'", path.display()),
            source,
        })?;
        config.validate()?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Loads `path` if given, else the default config file if it exists,
    /// else the built-in defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a file is found but cannot be loaded. An
    /// explicit `path` that does not exist is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!("no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Checks every value against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_CONCURRENT_LIMIT).contains(&self.max_concurrent) {
            return Err(ConfigError::invalid(
                "max_concurrent",
                self.max_concurrent,
                "1..=100",
            ));
        }
        if !(1024..=16 * 1024 * 1024).contains(&self.chunk_size) {
            return Err(ConfigError::invalid(
                "chunk_size",
                self.chunk_size,
                "1024..=16777216",
            ));
        }
        if !(10..=60_000).contains(&self.checkpoint_interval_ms) {
            return Err(ConfigError::invalid(
                "checkpoint_interval_ms",
                self.checkpoint_interval_ms,
                "10..=60000",
            ));
        }
        if self.checkpoint_bytes == 0 {
            return Err(ConfigError::invalid("checkpoint_bytes", 0, "1.."));
        }
        validate_timeout_secs("stall_timeout_secs", self.stall_timeout_secs)?;
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        if !(1..=65_536).contains(&self.progress_capacity) {
            return Err(ConfigError::invalid(
                "progress_capacity",
                self.progress_capacity,
                "1..=65536",
            ));
        }
        if !(1..=20).contains(&self.db_max_connections) {
            return Err(ConfigError::invalid(
                "db_max_connections",
                self.db_max_connections,
                "1..=20",
            ));
        }
        if self.db_busy_timeout_ms > 120_000 {
            return Err(ConfigError::invalid(
                "db_busy_timeout_ms",
                self.db_busy_timeout_ms,
                "0..=120000",
            ));
        }

        let retry = &self.retry;
        if !(1..=100).contains(&retry.max_attempts) {
            return Err(ConfigError::invalid(
                "retry.max_attempts",
                retry.max_attempts,
                "1..=100",
            ));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(ConfigError::invalid(
                "retry.base_delay_ms",
                retry.base_delay_ms,
                "0..=retry.max_delay_ms",
            ));
        }
        if retry.max_delay_ms > 3_600_000 {
            return Err(ConfigError::invalid(
                "retry.max_delay_ms",
                retry.max_delay_ms,
                "0..=3600000",
            ));
        }
        if retry.jitter_ms > 60_000 {
            return Err(ConfigError::invalid(
                "retry.jitter_ms",
                retry.jitter_ms,
                "0..=60000",
            ));
        }
        Ok(())
    }

    /// Fetch tunables derived from this config.
    #[must_use]
    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            chunk_size: self.chunk_size,
            checkpoint_interval: Duration::from_millis(self.checkpoint_interval_ms),
            checkpoint_bytes: self.checkpoint_bytes,
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
        }
    }

    /// Retry policy derived from this config.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
            Duration::from_millis(self.retry.jitter_ms),
        )
    }

    /// Database pool options derived from this config.
    #[must_use]
    pub fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            max_connections: self.db_max_connections,
            busy_timeout_ms: self.db_busy_timeout_ms,
        }
    }

    /// HTTP connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn validate_timeout_secs(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if (1..=3600).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, value, "1..=3600"))
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn env_var_non_empty_os(name: &str) -> Option<OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Default config file location.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/transfer-manager/config.toml`
/// 2. `$HOME/.config/transfer-manager/config.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    config_path_from(
        env_var_non_empty_os("XDG_CONFIG_HOME"),
        env_var_non_empty_os("HOME"),
    )
}

fn config_path_from(xdg_config_home: Option<OsString>, home: Option<OsString>) -> Option<PathBuf> {
    if let Some(xdg) = xdg_config_home {
        return Some(PathBuf::from(xdg).join(APP_DIR).join(CONFIG_FILE));
    }
    let home = home?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join(CONFIG_FILE),
    )
}

/// Default database location.
///
/// `$XDG_DATA_HOME/transfer-manager/transfers.db`, else
/// `$HOME/.local/share/transfer-manager/transfers.db`, else `transfers.db` in
/// the working directory.
#[must_use]
pub fn default_database_path() -> PathBuf {
    database_path_from(
        env_var_non_empty_os("XDG_DATA_HOME"),
        env_var_non_empty_os("HOME"),
    )
}

fn database_path_from(xdg_data_home: Option<OsString>, home: Option<OsString>) -> PathBuf {
    if let Some(xdg) = xdg_data_home {
        return PathBuf::from(xdg).join(APP_DIR).join(DATABASE_FILE);
    }
    match home {
        Some(home) => PathBuf::from(home)
            .join(".local")
            .join("share")
            .join(APP_DIR)
            .join(DATABASE_FILE),
        None => PathBuf::from(DATABASE_FILE),
    }
}
