//! Exponential backoff for transient database failures.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::GatewayResult;

/// How many times to try a statement and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay before the second attempt; doubles after every failure.
    pub initial_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            initial_backoff_ms: 0,
        }
    }

    /// Delay after the failed attempt with 0-based index `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }
}

/// Does this error message describe a connection or transport problem?
pub fn is_transient_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("connect") || message.contains("terminated")
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts. The last error is returned.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> GatewayResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient database error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
