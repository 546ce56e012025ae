//! Retry logic with exponential backoff
//!
//! Every call to the task store goes through [`call_with_retry`]: each attempt
//! runs under a timeout, and transient failures are retried with exponential
//! backoff and optional jitter until the attempt budget is spent.
//!
//! # Example
//!
//! ```no_run
//! use archive_cacher::retry::call_with_retry;
//! use archive_cacher::config::RetryConfig;
//! use archive_cacher::error::Error;
//!
//! # async fn example() -> Result<(), Error> {
//! let config = RetryConfig::default();
//! let lease = call_with_retry(&config, "request_task", || async {
//!     // Your store call here
//!     Ok::<_, Error>(7)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{ArchiveError, DatabaseError, Error};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, busy database, connection reset) return `true`.
/// Permanent failures (bad lease, invalid listing, missing paths) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Timeout { .. } => true,
            // SQLite reports contention as "database is locked" / "busy"
            Error::Database(DatabaseError::QueryFailed(msg))
            | Error::Database(DatabaseError::ConnectionFailed(msg)) => {
                msg.contains("locked") || msg.contains("busy") || msg.contains("timed out")
            }
            Error::Database(_) => false,
            Error::Sqlx(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed
            ),
            // 503 means the archive is offline for maintenance, waiting won't help this run
            Error::Archive(ArchiveError::Http { status, .. }) => {
                *status == 429 || (*status >= 500 && *status != 503)
            }
            Error::Archive(_) => false,
            Error::Config { .. }
            | Error::Serialization(_)
            | Error::InsufficientSpace { .. }
            | Error::DiskSpaceCheckFailed(_)
            | Error::MissingCachePath { .. }
            | Error::RunawayEviction { .. }
            | Error::TaskProcessing { .. }
            | Error::Other(_) => false,
        }
    }
}

/// Run a store or archive call with a per-attempt timeout and bounded retries
///
/// `config.max_attempts` counts every attempt including the first. An attempt
/// that exceeds `config.call_timeout` fails with [`Error::Timeout`], which is
/// retryable.
pub async fn call_with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let timeout = config.call_timeout;
    retry_with_backoff(config, || {
        let attempt = operation();
        async move {
            match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    operation: operation_name.to_string(),
                    seconds: timeout.as_secs(),
                }),
            }
        }
    })
    .await
}

/// Execute an async operation with exponential backoff retry logic
///
/// Returns the successful result or the last error once `config.max_attempts`
/// attempts have been made. Non-retryable errors are returned immediately.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt: u32 = 1;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                tracing::warn!(
                    error = %e,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                let jittered_delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };

                tokio::time::sleep(jittered_delay).await;

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// result lies between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
