//! Database readiness gate.
//!
//! Containers for the app and the database usually start together, so the
//! first query must wait until PostgreSQL actually accepts connections.

use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{GatewayError, MigrationError};
use crate::gateway::Executor;

/// Polling schedule for [`wait_until_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval_ms: 2000,
        }
    }
}

impl ReadinessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Poll with `SELECT 1` until it succeeds or attempts run out.
///
/// Each probe is cut off after one interval, so a hung connect counts as
/// a failed attempt. Exhaustion is fatal: there is no degraded mode.
pub async fn wait_until_ready<E: Executor>(
    executor: &E,
    config: &ReadinessConfig,
) -> Result<(), MigrationError> {
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let outcome = match tokio::time::timeout(config.interval(), executor.probe()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(GatewayError::Connection(format!(
                "no answer within {} ms",
                config.interval_ms
            ))),
        };

        match outcome {
            Ok(()) => {
                info!(attempt, "database is ready");
                return Ok(());
            }
            Err(err) if attempt >= max_attempts => {
                return Err(MigrationError::DatabaseUnavailable {
                    attempts: attempt,
                    last_error: err,
                });
            }
            Err(err) => {
                warn!(attempt, max_attempts, error = %err, "database not ready yet");
                tokio::time::sleep(config.interval()).await;
                attempt += 1;
            }
        }
    }
}
