//! Configuration
//!
//! Layered, last wins:
//! 1. built-in defaults
//! 2. TOML file (`--config`, else `<config dir>/locket/migrate.toml` if present)
//! 3. `DATABASE_URL` from the environment
//! 4. command-line flags (applied by the binary)
//!
//! ```toml
//! database_url = "postgres://locket@localhost/locket"
//!
//! [pool]
//! max_connections = 5
//!
//! [retry]
//! attempts = 5
//! initial_backoff_ms = 500
//!
//! [readiness]
//! max_attempts = 10
//! interval_ms = 2000
//!
//! [migrations]
//! ledger_table = "schema_migrations"
//! lock = "advisory"
//! checksum_policy = "strict"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;
use crate::gateway::PoolConfig;
use crate::ledger::LedgerTable;
use crate::lock::{DEFAULT_ADVISORY_LOCK_KEY, LockMode};
use crate::readiness::ReadinessConfig;
use crate::retry::RetryPolicy;
use crate::runner::ChecksumPolicy;

/// Environment variable holding the connection string.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: Option<String>,
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub readiness: ReadinessConfig,
    pub migrations: MigrationsConfig,
}

/// Runner settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    pub ledger_table: LedgerTable,
    pub lock: LockMode,
    pub advisory_lock_key: i64,
    pub checksum_policy: ChecksumPolicy,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            ledger_table: LedgerTable::default(),
            lock: LockMode::None,
            advisory_lock_key: DEFAULT_ADVISORY_LOCK_KEY,
            checksum_policy: ChecksumPolicy::Warn,
        }
    }
}

impl Config {
    /// Load from `path`, or the default location, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "loading config");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay environment variables, looked up through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(DATABASE_URL_ENV).filter(|u| !u.trim().is_empty()) {
            self.database_url = Some(url);
        }
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::MissingDatabaseUrl)
    }
}

/// `<config dir>/locket/migrate.toml`.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("locket").join("migrate.toml"))
}
