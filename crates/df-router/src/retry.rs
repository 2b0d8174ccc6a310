//! Bounded retry around optimistic read-modify-write cycles.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use df_core::config::RetryConfig;
use df_core::{Error, Result};
use rand::Rng;

/// How often and how patiently to retry transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from the initial backoff
    /// with up to 50% jitter, capped at the maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_backoff);
        let jitter_ms = base.as_millis() as u64 / 2;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        (base + Duration::from_millis(jitter)).min(self.max_backoff)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// `op` receives the 1-based attempt number and must redo its whole cycle
/// from a fresh read. Only [`Error::is_transient`] failures are retried.
///
/// # Errors
///
/// Non-transient errors are returned as-is. When the attempts run out on a
/// version conflict the result is [`Error::ConflictExhausted`]; any other
/// transient error is returned unchanged.
pub async fn retry_on_conflict<T, F, Fut>(policy: &RetryPolicy, id: impl Display, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(id = %id, attempt, delay_ms = delay.as_millis() as u64, "Retrying after {e}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(Error::Conflict { .. }) => {
                tracing::error!(id = %id, attempts = attempt, "Gave up after repeated version conflicts");
                return Err(Error::ConflictExhausted {
                    id: id.to_string(),
                    attempts: attempt,
                });
            }
            Err(e) => return Err(e),
        }
    }
}
