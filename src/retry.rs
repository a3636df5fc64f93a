//! Retry logic with exponential backoff
//!
//! Transient request failures (connection resets, timeouts, retryable HTTP
//! statuses such as 429 or 503) are retried with exponential backoff and
//! optional jitter. The caller can observe each failed attempt, which is how
//! the HTTP layer surfaces attempt counts as [`Event::RequestRetry`](crate::Event).
//! Waiting between attempts stops as soon as the export is cancelled.
//!
//! # Example
//!
//! ```no_run
//! use bulk_data_client::Error;
//! use bulk_data_client::config::RetryConfig;
//! use bulk_data_client::retry::with_retry;
//!
//! # async fn fetch_manifest() -> Result<String, Error> { Ok(String::new()) }
//! # async fn example() -> Result<(), Error> {
//! // 429 and 503 answers (FileDownload / Protocol errors) are retried by status
//! let manifest = with_retry(&RetryConfig::default(), fetch_manifest).await?;
//! println!("{manifest}");
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, connection reset) should return `true`.
/// Permanent failures (bad input, corrupt data, 404) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;

    /// HTTP status carried by the error, checked against [`RetryConfig::status_codes`]
    fn status_code(&self) -> Option<u16> {
        None
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
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
            // Status-based retries are decided against the configured code list
            Error::FileDownload { .. } => false,
            Error::Protocol { .. }
            | Error::Framing(_)
            | Error::Integrity(_)
            | Error::Transport(_)
            | Error::Serialization(_)
            | Error::Config { .. }
            | Error::Queue(_)
            | Error::Cancelled
            | Error::NotSupported(_)
            | Error::Other(_) => false,
        }
    }

    fn status_code(&self) -> Option<u16> {
        match self {
            Error::FileDownload { status, .. } => Some(*status),
            Error::Protocol {
                response: Some(response),
                ..
            } => Some(response.status),
            _ => None,
        }
    }
}

/// Whether `error` should be retried under `config`
pub fn should_retry<E: IsRetryable>(config: &RetryConfig, error: &E) -> bool {
    error.is_retryable()
        || error
            .status_code()
            .is_some_and(|code| config.status_codes.contains(&code))
}

/// Execute an async operation with exponential backoff retry logic
///
/// Returns the successful result or the last error after all retry attempts
/// are exhausted. `max_attempts` counts retries, so the operation runs at most
/// `max_attempts + 1` times.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    with_retry_observed(config, &CancellationToken::new(), |_, _, _| {}, operation).await
}

/// Like [`with_retry`], calling `on_retry(attempt, &error, delay)` before each wait
///
/// When `cancel` fires during a wait, the wait ends at once and the error of
/// the last attempt is returned.
pub async fn with_retry_observed<F, Fut, T, E, O>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut on_retry: O,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
    O: FnMut(u32, &E, Duration),
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Request succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if should_retry(config, &e) && attempt < config.max_attempts => {
                attempt += 1;

                let jittered_delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = jittered_delay.as_millis() as u64,
                    "Request failed, retrying"
                );
                on_retry(attempt, &e, jittered_delay);

                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(attempt, "Retry wait cancelled");
                        return Err(e);
                    }
                    _ = tokio::time::sleep(jittered_delay) => {}
                }

                delay = next_delay(delay, config);
            }
            Err(e) => {
                if should_retry(config, &e) {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Request failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::debug!(error = %e, "Request failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Grow `delay` by the backoff multiplier, capped at `max_delay`
fn next_delay(delay: Duration, config: &RetryConfig) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier)
        .map_or(config.max_delay, |next| next.min(config.max_delay))
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The result lies between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
