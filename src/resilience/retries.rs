//! Retry logic.
//!
//! # Responsibilities
//! - Execute a fallible async operation up to `max_attempts` times
//! - Sleep with jittered exponential backoff between attempts
//! - Stop early when the caller marks an error as permanent
//!
//! # Design Decisions
//! - Retries are off entirely when `retries.enabled` is false
//! - Jittered backoff prevents thundering herd
//! - Only upstream connects and telemetry flushes go through here;
//!   relayed bytes are never replayed

use std::fmt::Display;
use std::future::Future;

use crate::config::RetryConfig;
use crate::resilience::backoff::retry_delay;

/// Run `op` until it succeeds, the attempts run out, or `retryable` rejects an error.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = if config.enabled {
        config.max_attempts.max(1)
    } else {
        1
    };

    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < max_attempts && retryable(&e) => {
                attempt += 1;
                let delay = retry_delay(config, attempt);
                tracing::info!(
                    operation,
                    attempt,
                    delay = ?delay,
                    error = %e,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
