//! Query Gateway
//!
//! Every database call in the crate goes through [`Executor::execute`].
//! [`QueryGateway`] is the production implementation: a bounded sqlx pool
//! with exponential-backoff retry on connection failures.

mod row;

pub use row::{Row, RowSet, Value};

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions as _, Connection as _, Postgres, Row as _, TypeInfo, ValueRef};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ConfigError, GatewayError, GatewayResult};
use crate::retry::{self, RetryPolicy};

/// Executes one SQL statement and returns its rows.
///
/// Implementations are not transactional across calls: each `execute` is
/// its own implicit unit unless the statement itself opens a transaction.
pub trait Executor: Send + Sync {
    fn execute(
        &self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = GatewayResult<RowSet>> + Send;

    /// Single trivial round trip used by the readiness gate.
    fn probe(&self) -> impl Future<Output = GatewayResult<()>> + Send {
        async move {
            self.execute("SELECT 1", &[]).await?;
            Ok(())
        }
    }
}

/// An executor that can hand out a session pinned to one connection.
///
/// Session-scoped state such as advisory locks only works when every
/// statement runs on the same backend.
pub trait SessionSource: Executor {
    type Session: Executor;

    fn pin(&self) -> impl Future<Output = GatewayResult<Self::Session>> + Send;
}

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of pooled connections.
    pub max_connections: u32,
    /// How long to wait for a free connection.
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_secs: 10,
        }
    }
}

/// Pooled PostgreSQL executor with retry.
#[derive(Debug, Clone)]
pub struct QueryGateway {
    pool: PgPool,
    retry: RetryPolicy,
}

impl QueryGateway {
    /// Build a gateway without opening a connection.
    ///
    /// Connections are established on first use, so this succeeds even
    /// while the database is still booting.
    pub fn connect_lazy(url: &str, pool: &PoolConfig, retry: RetryPolicy) -> Result<Self, ConfigError> {
        let pool = PgPoolOptions::new()
            .max_connections(pool.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(pool.acquire_timeout_secs))
            .connect_lazy(url)
            .map_err(|e| ConfigError::InvalidDatabaseUrl(e.to_string()))?;
        Ok(Self::from_pool(pool, retry))
    }

    pub fn from_pool(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// One attempt: borrow a connection, run, hand it back.
    ///
    /// The pool connection is returned when `conn` drops, on every path.
    async fn execute_once(&self, sql: &str, params: &[Value]) -> GatewayResult<RowSet> {
        let mut conn = self.pool.acquire().await?;
        run_on(&mut conn, sql, params).await
    }

    /// Close the pool, waiting for borrowed connections to come back.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl Executor for QueryGateway {
    async fn execute(&self, sql: &str, params: &[Value]) -> GatewayResult<RowSet> {
        retry::with_backoff(&self.retry, || self.execute_once(sql, params)).await
    }

    /// Dials a fresh connection instead of waiting on the pool, so a
    /// refused connect surfaces at once with its real cause rather than as
    /// an acquire timeout.
    async fn probe(&self) -> GatewayResult<()> {
        let mut conn = self.pool.connect_options().connect().await?;
        run_on(&mut conn, "SELECT 1", &[]).await?;
        conn.close().await?;
        Ok(())
    }
}

impl SessionSource for QueryGateway {
    type Session = PinnedSession;

    async fn pin(&self) -> GatewayResult<PinnedSession> {
        let conn = retry::with_backoff(&self.retry, || async {
            self.pool.acquire().await.map_err(GatewayError::from)
        })
        .await?;
        Ok(PinnedSession {
            conn: Mutex::new(conn),
        })
    }
}

/// One pooled connection held for the lifetime of the value.
///
/// No retry: a lost connection loses the session state with it.
pub struct PinnedSession {
    conn: Mutex<PoolConnection<Postgres>>,
}

impl Executor for PinnedSession {
    async fn execute(&self, sql: &str, params: &[Value]) -> GatewayResult<RowSet> {
        let mut conn = self.conn.lock().await;
        run_on(&mut conn, sql, params).await
    }
}

async fn run_on(conn: &mut PgConnection, sql: &str, params: &[Value]) -> GatewayResult<RowSet> {
    debug!(sql, params = params.len(), "execute");
    let rows = bind_all(sqlx::query(sql), params).fetch_all(conn).await?;
    rows.iter().map(decode_row).collect::<GatewayResult<Vec<_>>>().map(RowSet::new)
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Int(n) => query.bind(*n),
            Value::Text(s) => query.bind(s.as_str()),
            Value::Timestamp(ts) => query.bind(*ts),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> GatewayResult<Row> {
    let mut decoded = Row::new();

    for (idx, column) in row.columns().iter().enumerate() {
        if row.try_get_raw(idx)?.is_null() {
            decoded.push(column.name(), Value::Null);
            continue;
        }

        let value = match column.type_info().name() {
            "BOOL" => Value::Bool(row.try_get(idx)?),
            "INT2" => Value::Int(row.try_get::<i16, _>(idx)?.into()),
            "INT4" => Value::Int(row.try_get::<i32, _>(idx)?.into()),
            "INT8" => Value::Int(row.try_get(idx)?),
            "TEXT" | "VARCHAR" | "NAME" | "BPCHAR" => Value::Text(row.try_get(idx)?),
            "TIMESTAMPTZ" => Value::Timestamp(row.try_get::<DateTime<Utc>, _>(idx)?),
            "TIMESTAMP" => Value::Timestamp(row.try_get::<NaiveDateTime, _>(idx)?.and_utc()),
            "VOID" => Value::Null,
            other => {
                return Err(GatewayError::Decode(format!(
                    "unsupported type {} for column `{}`",
                    other,
                    column.name()
                )));
            }
        };
        decoded.push(column.name(), value);
    }

    Ok(decoded)
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => GatewayError::Database {
                code: db.code().map(|c| c.into_owned()),
                message: db.message().to_string(),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => GatewayError::Connection(err.to_string()),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => GatewayError::Decode(err.to_string()),
            other => GatewayError::Database {
                code: None,
                message: other.to_string(),
            },
        }
    }
}
