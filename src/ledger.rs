//! Migration ledger
//!
//! One row per completed definition. A row's existence is the only record
//! that a definition ran; rows are never updated or deleted.

use std::fmt;

use serde::Deserialize;
use tracing::debug;

use crate::error::{ConfigError, GatewayResult};
use crate::gateway::{Executor, Row, Value};
use crate::migration::MigrationRecord;
use crate::step::{Guard, Step};

/// Default ledger table name.
pub const DEFAULT_LEDGER_TABLE: &str = "schema_migrations";

/// PostgreSQL keywords that cannot name a table without quoting. Sorted.
const RESERVED_KEYWORDS: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric",
    "authorization", "binary", "both", "case", "cast", "check", "collate", "collation",
    "column", "concurrently", "constraint", "create", "cross", "current_catalog",
    "current_date", "current_role", "current_schema", "current_time", "current_timestamp",
    "current_user", "default", "deferrable", "desc", "distinct", "do", "else", "end",
    "except", "false", "fetch", "for", "foreign", "freeze", "from", "full", "grant", "group",
    "having", "ilike", "in", "initially", "inner", "intersect", "into", "is", "isnull",
    "join", "lateral", "leading", "left", "like", "limit", "localtime", "localtimestamp",
    "natural", "not", "notnull", "null", "offset", "on", "only", "or", "order", "outer",
    "overlaps", "placing", "primary", "references", "returning", "right", "select",
    "session_user", "similar", "some", "symmetric", "system_user", "table", "tablesample",
    "then", "to", "trailing", "true", "union", "unique", "user", "using", "variadic",
    "verbose", "when", "where", "window", "with",
];

/// A validated, unquoted SQL identifier naming the ledger table.
///
/// Reserved keywords are rejected: the name is interpolated into SQL as is.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct LedgerTable(String);

impl LedgerTable {
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        let mut chars = name.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
        let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

        let reserved = RESERVED_KEYWORDS.binary_search(&name.as_str()).is_ok();

        if valid_start && valid_rest && !reserved && name.len() <= 63 {
            Ok(Self(name))
        } else {
            Err(ConfigError::InvalidIdentifier(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LedgerTable {
    fn default() -> Self {
        Self(DEFAULT_LEDGER_TABLE.to_string())
    }
}

impl TryFrom<String> for LedgerTable {
    type Error = ConfigError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::new(name)
    }
}

impl fmt::Display for LedgerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ledger operations over any executor.
pub struct Ledger<'a, E> {
    executor: &'a E,
    table: &'a LedgerTable,
}

impl<'a, E: Executor> Ledger<'a, E> {
    pub fn new(executor: &'a E, table: &'a LedgerTable) -> Self {
        Self { executor, table }
    }

    /// Bootstrap steps: create the table, then add `checksum` to ledgers
    /// created before it existed. On a current ledger both guards are false
    /// and only `SELECT`s are issued.
    pub fn bootstrap_steps(&self) -> Vec<Step> {
        let table = self.table.as_str();
        vec![
            Step::when(
                Guard::table_missing(table),
                format!("create ledger table {}", table),
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (\
                     id BIGSERIAL PRIMARY KEY, \
                     name TEXT NOT NULL UNIQUE, \
                     executed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
                     checksum TEXT)",
                    table
                ),
            ),
            Step::add_column(table, "checksum", "TEXT"),
        ]
    }

    /// Run the bootstrap steps.
    ///
    /// A process that loses the race to create the ledger re-checks the
    /// step's guard, which now reports the table in place.
    pub async fn ensure_exists(&self) -> GatewayResult<()> {
        for step in self.bootstrap_steps() {
            let outcome = match step.apply(self.executor).await {
                Err(err) if err.is_duplicate_object() => {
                    debug!(step = %step.description, error = %err, "ledger bootstrapped concurrently");
                    step.apply(self.executor).await?
                }
                outcome => outcome?,
            };
            debug!(step = %step.description, ?outcome, "ledger bootstrap");
        }
        Ok(())
    }

    pub async fn has_run(&self, name: &str) -> GatewayResult<bool> {
        Ok(self.find(name).await?.is_some())
    }

    /// Look up one record. A missing ledger table means nothing has run.
    pub async fn find(&self, name: &str) -> GatewayResult<Option<MigrationRecord>> {
        let sql = format!("{} WHERE name = $1", self.select());
        match self.executor.execute(&sql, &[Value::from(name)]).await {
            Ok(rows) => rows.first().map(decode_record).transpose(),
            Err(err) if err.is_undefined_table() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// All records in insertion order. A missing ledger table is empty.
    pub async fn records(&self) -> GatewayResult<Vec<MigrationRecord>> {
        let sql = format!("{} ORDER BY id", self.select());
        match self.executor.execute(&sql, &[]).await {
            Ok(rows) => rows.iter().map(decode_record).collect(),
            Err(err) if err.is_undefined_table() => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Insert a record; a concurrent or repeated insert is absorbed.
    pub async fn record_run(&self, name: &str, checksum: &str) -> GatewayResult<()> {
        let sql = format!(
            "INSERT INTO {} (name, checksum) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
            self.table
        );
        self.executor
            .execute(&sql, &[Value::from(name), Value::from(checksum)])
            .await?;
        Ok(())
    }

    // `to_jsonb` keeps reads working on ledgers that predate `checksum`.
    fn select(&self) -> String {
        format!(
            "SELECT id, name, executed_at, to_jsonb(l) ->> 'checksum' AS checksum FROM {} l",
            self.table
        )
    }
}

fn decode_record(row: &Row) -> GatewayResult<MigrationRecord> {
    Ok(MigrationRecord {
        id: row.int("id")?,
        name: row.text("name")?,
        executed_at: row.timestamp("executed_at")?,
        checksum: row.opt_text("checksum")?,
    })
}
