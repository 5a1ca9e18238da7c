//! Configuration module for keyshift
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then command-line flags and `KEYSHIFT_*` environment variables applied by
//! the binary.
//!
//! ```toml
//! [source]
//! host = "10.0.0.1"
//! db = 0
//!
//! [target]
//! host = "10.0.0.2"
//! password = "secret"
//!
//! [migration]
//! chunk_size = 1000
//! timeout_ms = 5000
//! dry_run = true
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::{ConnectOptions, Endpoint};
use crate::error::{MigrateError, Result};
use crate::store::{Location, TransferAuth};

/// Default Redis port
pub const DEFAULT_PORT: u16 = 6379;

/// Default number of keys requested per SCAN call
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default MIGRATE timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Slack added on top of the MIGRATE timeout for the client-side bound on
/// each round trip, so the server gets to report its own timeout first.
pub const CALL_TIMEOUT_GRACE: Duration = Duration::from_millis(1000);

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store the keys are copied from
    pub source: StoreConfig,

    /// Store the keys are copied to
    pub target: StoreConfig,

    /// Migration run settings
    pub migration: MigrationSettings,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::Config(format!("failed to read config file {:?}: {}", path, e))
        })?;

        Self::parse_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn parse_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| MigrateError::Config(format!("failed to parse config: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.source.validate("source")?;
        self.target.validate("target")?;
        self.migration.validate()?;

        if self.source.endpoint() == self.target.endpoint() && self.source.db == self.target.db {
            return Err(MigrateError::Config(format!(
                "source and target are the same store ({} db {})",
                self.source.endpoint(),
                self.source.db
            )));
        }

        Ok(())
    }

    /// Connection options for the source store
    pub fn source_connect_options(&self) -> ConnectOptions {
        self.source.connect_options(&self.migration)
    }

    /// Connection options for the target store
    pub fn target_connect_options(&self) -> ConnectOptions {
        self.target.connect_options(&self.migration)
    }

    /// Destination of every transfer, carrying the target credentials so
    /// the source can log in to the target.
    pub fn target_location(&self) -> Location {
        let mut location = Location::new(self.target.endpoint(), self.target.db);
        location.auth = self.target.password.as_ref().map(|password| TransferAuth {
            username: self.target.username.clone(),
            password: password.clone(),
        });
        location
    }
}

/// Connection settings for one store
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Hostname or IP address
    pub host: String,

    /// TCP port
    pub port: u16,

    /// Logical database index
    pub db: u32,

    /// ACL username
    pub username: Option<String>,

    /// Password
    pub password: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            db: 0,
            username: None,
            password: None,
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db", &self.db)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl StoreConfig {
    /// The `host:port` address of this store
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    fn validate(&self, role: &str) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(MigrateError::Config(format!("{}-host is required", role)));
        }
        if self.port == 0 {
            return Err(MigrateError::Config(format!("{} port cannot be 0", role)));
        }
        if self.username.is_some() && self.password.is_none() {
            return Err(MigrateError::Config(format!(
                "{} username given without a password",
                role
            )));
        }
        Ok(())
    }

    fn connect_options(&self, settings: &MigrationSettings) -> ConnectOptions {
        ConnectOptions {
            endpoint: self.endpoint(),
            username: self.username.clone(),
            password: self.password.clone(),
            db: self.db,
            connect_timeout: settings.connect_timeout(),
            call_timeout: settings.call_timeout(),
        }
    }
}

/// Settings for one migration run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// SCAN COUNT hint
    pub chunk_size: usize,

    /// MIGRATE timeout in milliseconds
    pub timeout_ms: u64,

    /// Connect plus handshake timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Check and count, but never transfer
    pub dry_run: bool,

    /// Concurrent per-key workers (1 = sequential)
    pub workers: usize,

    /// Optional SCAN MATCH pattern
    pub pattern: Option<String>,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            connect_timeout_ms: 10_000,
            dry_run: false,
            workers: 1,
            pattern: None,
        }
    }
}

impl MigrationSettings {
    /// MIGRATE timeout
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Client-side bound on every command round trip
    pub fn call_timeout(&self) -> Duration {
        self.transfer_timeout() + CALL_TIMEOUT_GRACE
    }

    /// Bound on connection setup
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(MigrateError::Config("chunk size cannot be 0".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(MigrateError::Config("timeout cannot be 0".to_string()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(MigrateError::Config(
                "connect timeout cannot be 0".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(MigrateError::Config("workers cannot be 0".to_string()));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format
    #[default]
    Pretty,

    /// JSON format
    Json,
}
