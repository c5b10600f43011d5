//! Optional advisory lock around a migration run.
//!
//! Without it, two instances booting together can both see a definition
//! as pending and both apply it. The ledger absorbs the duplicate insert
//! and guarded steps tolerate the double apply, but only the lock
//! serializes the check-then-apply window. Off unless configured.

use std::future::Future;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::MigrationError;
use crate::gateway::{Executor, Value};

/// Default `pg_advisory_lock` key (ASCII "locket").
pub const DEFAULT_ADVISORY_LOCK_KEY: i64 = 0x6c6f_636b_6574;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    #[default]
    None,
    /// Session-level `pg_advisory_lock` held for the whole run.
    Advisory,
}

/// Run `body` while holding the advisory lock on `session`.
///
/// `session` must be pinned to one connection. The lock is released on
/// success and on failure; an unlock error only replaces a successful
/// outcome.
pub async fn with_advisory_lock<E, F, Fut, T>(
    session: &E,
    key: i64,
    body: F,
) -> Result<T, MigrationError>
where
    E: Executor,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, MigrationError>>,
{
    info!(key, "waiting for migration lock");
    session
        .execute("SELECT pg_advisory_lock($1)", &[Value::Int(key)])
        .await
        .map_err(MigrationError::Lock)?;
    info!(key, "migration lock acquired");

    let outcome = body().await;

    let released = session
        .execute("SELECT pg_advisory_unlock($1) AS released", &[Value::Int(key)])
        .await;

    match (outcome, released) {
        (Ok(value), Ok(_)) => {
            info!(key, "migration lock released");
            Ok(value)
        }
        (Ok(_), Err(err)) => Err(MigrationError::Lock(err)),
        (Err(err), Ok(_)) => Err(err),
        (Err(err), Err(unlock)) => {
            warn!(key, error = %unlock, "failed to release migration lock");
            Err(err)
        }
    }
}
