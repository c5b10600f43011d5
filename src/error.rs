//! Error types for every layer of the migrator.

use std::path::PathBuf;

use thiserror::Error;

use crate::retry::is_transient_message;

/// SQLSTATE for `undefined_table`.
pub const UNDEFINED_TABLE: &str = "42P01";
/// SQLSTATE for `unique_violation`.
pub const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE for `duplicate_table`.
pub const DUPLICATE_TABLE: &str = "42P07";
/// SQLSTATE for `duplicate_column`.
pub const DUPLICATE_COLUMN: &str = "42701";

/// Errors surfaced by the query gateway.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The connection could not be established, was lost, or the pool
    /// timed out handing one out.
    #[error("connection error: {0}")]
    Connection(String),

    /// The database rejected the statement.
    #[error("database error: {message}")]
    Database {
        /// SQLSTATE, when the server supplied one.
        code: Option<String>,
        message: String,
    },

    /// A row came back in a shape we could not read.
    #[error("decode error: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Build a database error carrying a SQLSTATE code.
    pub fn database(code: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::Database {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Whether retrying the same statement could plausibly succeed.
    ///
    /// Only connection and transport failures qualify. Constraint
    /// violations, syntax errors and the like fail the first time.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Decode(_) => false,
            other => is_transient_message(&other.to_string()),
        }
    }

    /// The SQLSTATE code, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            GatewayError::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// True when the statement referenced a table that does not exist.
    pub fn is_undefined_table(&self) -> bool {
        self.code() == Some(UNDEFINED_TABLE)
    }

    /// True when a concurrent session created the same object first.
    ///
    /// `IF NOT EXISTS` does not cover that race: the loser gets a catalog
    /// unique violation or a duplicate-object error instead.
    pub fn is_duplicate_object(&self) -> bool {
        matches!(
            self.code(),
            Some(UNIQUE_VIOLATION | DUPLICATE_TABLE | DUPLICATE_COLUMN)
        )
    }
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors surfaced while preparing or applying migrations.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("database unavailable after {attempts} attempt(s): {last_error}")]
    DatabaseUnavailable {
        attempts: u32,
        #[source]
        last_error: GatewayError,
    },

    #[error("migration ledger error: {0}")]
    Ledger(#[source] GatewayError),

    #[error("migration `{name}` failed at step {step}: {source}")]
    Definition {
        name: String,
        /// 1-based index of the failing step.
        step: usize,
        #[source]
        source: GatewayError,
    },

    #[error("duplicate migration definition `{0}`")]
    DuplicateDefinition(String),

    #[error(
        "migration `{name}` changed after it ran (recorded checksum {recorded}, current {current})"
    )]
    ChecksumMismatch {
        name: String,
        recorded: String,
        current: String,
    },

    #[error("advisory lock error: {0}")]
    Lock(#[source] GatewayError),
}

impl MigrationError {
    /// Name of the definition this error belongs to, if any.
    pub fn migration_name(&self) -> Option<&str> {
        match self {
            MigrationError::Definition { name, .. }
            | MigrationError::ChecksumMismatch { name, .. }
            | MigrationError::DuplicateDefinition(name) => Some(name),
            _ => None,
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("no database URL configured (set DATABASE_URL or database_url)")]
    MissingDatabaseUrl,

    #[error("invalid SQL identifier `{0}`")]
    InvalidIdentifier(String),

    #[error("invalid database URL: {0}")]
    InvalidDatabaseUrl(String),
}
