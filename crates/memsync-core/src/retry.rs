//! Exponential backoff for retryable failures.

use crate::error::SyncError;
use log::{info, warn};
use memsync_config::RetryConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `config.max_retries` retries have been spent.
///
/// Non-retryable errors are returned unchanged on the first occurrence.
/// Exhausting the retries yields [`SyncError::RetryExhausted`] wrapping the
/// last error.
pub async fn retry_with_backoff<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut delay = Duration::from_millis(config.initial_backoff_ms);
    let max_delay = Duration::from_millis(config.max_backoff_ms);
    let mut attempts: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempts > 0 {
                    info!(
                        "operation succeeded after retries (operation={}, retries={})",
                        operation_name, attempts
                    );
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                attempts += 1;
                if attempts > config.max_retries {
                    warn!(
                        "giving up (operation={}, attempts={}, error={})",
                        operation_name, attempts, err
                    );
                    return Err(SyncError::RetryExhausted {
                        operation: operation_name.to_string(),
                        attempts,
                        last: Box::new(err),
                    });
                }
                let wait = if config.jitter { jittered(delay) } else { delay };
                warn!(
                    "retrying (operation={}, attempt={}/{}, wait_ms={}, error={})",
                    operation_name,
                    attempts,
                    config.max_retries,
                    wait.as_millis(),
                    err
                );
                sleep(wait).await;
                delay = next_delay(delay, config.backoff_multiplier, max_delay);
            }
        }
    }
}

/// Grow `delay` by `multiplier`, capped at `max`. Products that are not a
/// valid duration (overflow, NaN, negative) saturate at `max`.
fn next_delay(delay: Duration, multiplier: f64, max: Duration) -> Duration {
    scaled(delay, multiplier).map_or(max, |next| next.min(max))
}

/// Stretch `delay` by up to 25%.
fn jittered(delay: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(0.0..=0.25);
    scaled(delay, 1.0 + factor).unwrap_or(delay)
}

fn scaled(delay: Duration, factor: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).ok()
}
