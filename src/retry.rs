//! Bounded-attempt retry for object transfers
//!
//! Each attempt is an independent operation. Attempts stop when one succeeds,
//! when the error is not retryable, when the attempt cap is reached, or when
//! the kill token fires. A kill never interrupts a running attempt; it only
//! prevents the next one.
//!
//! # Example
//!
//! ```no_run
//! use nexrad_sync::config::RetryConfig;
//! use nexrad_sync::error::Error;
//! use nexrad_sync::retry::download_with_retry;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let config = RetryConfig::default();
//! let kill = CancellationToken::new();
//! let result = download_with_retry(&config, &kill, |_attempt| async {
//!     Ok::<u64, Error>(1024)
//! })
//! .await;
//! assert!(result.is_ok());
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
/// Transient failures (timeouts, resets, truncated transfers) return `true`.
/// Permanent failures (missing object, bad configuration) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect() || e.is_body() || e.is_request(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::Other
            ),
            // Throttling and server-side failures clear up on their own
            Error::Store { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Error::SizeMismatch { .. } => true,
            Error::TransferTimeout { .. } => true,
            Error::ListingDecode(_) => false,
            Error::Config { .. } => false,
            Error::InvalidPath { .. } => false,
            Error::ExternalTool(_) => false,
            Error::Serialization(_) => false,
            Error::Cancelled => false,
            Error::Other(_) => false,
        }
    }
}

/// Why a retried operation gave up
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// Every allowed attempt failed with a retryable error
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: E,
    },
    /// An attempt failed with an error that is not worth retrying
    Permanent {
        /// Attempts made
        attempts: u32,
        /// The non-retryable error
        error: E,
    },
    /// The kill token fired before the next attempt could start
    Cancelled {
        /// Attempts made before the kill was observed
        attempts: u32,
        /// Error from the last attempt, if any was made
        last_error: Option<E>,
    },
}

impl<E> RetryFailure<E> {
    /// Number of attempts actually started
    pub fn attempts(&self) -> u32 {
        match self {
            RetryFailure::Exhausted { attempts, .. }
            | RetryFailure::Permanent { attempts, .. }
            | RetryFailure::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// Whether the failure was caused by the kill signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryFailure::Cancelled { .. })
    }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryFailure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryFailure::Exhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {attempts} attempts: {last_error}"),
            RetryFailure::Permanent { attempts, error } => {
                write!(f, "permanent failure on attempt {attempts}: {error}")
            }
            RetryFailure::Cancelled {
                attempts,
                last_error: Some(e),
            } => write!(f, "cancelled after {attempts} attempts (last error: {e})"),
            RetryFailure::Cancelled { attempts, .. } => {
                write!(f, "cancelled after {attempts} attempts")
            }
        }
    }
}

/// Run `operation` up to `config.max_attempts` times
///
/// The closure receives the 1-based attempt number. Between attempts the
/// function sleeps for the current backoff delay (zero by default); the sleep
/// is cut short by `kill`.
pub async fn download_with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    kill: &CancellationToken,
    mut operation: F,
) -> std::result::Result<T, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        if kill.is_cancelled() {
            return Err(RetryFailure::Cancelled {
                attempts: attempt - 1,
                last_error,
            });
        }

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(attempts = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if !e.is_retryable() => {
                tracing::debug!(error = %e, attempt, "Operation failed with non-retryable error");
                return Err(RetryFailure::Permanent {
                    attempts: attempt,
                    error: e,
                });
            }
            Err(e) if attempt == max_attempts => {
                tracing::debug!(
                    error = %e,
                    attempts = attempt,
                    "Operation failed after all attempts exhausted"
                );
                return Err(RetryFailure::Exhausted {
                    attempts: attempt,
                    last_error: e,
                });
            }
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                last_error = Some(e);

                if !delay.is_zero() {
                    let wait = if config.jitter { add_jitter(delay) } else { delay };
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = kill.cancelled() => {
                            return Err(RetryFailure::Cancelled {
                                attempts: attempt,
                                last_error,
                            });
                        }
                    }
                }

                let next = Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next.min(config.max_delay);
            }
        }
    }

    // max_attempts >= 1, so the loop always returns
    Err(RetryFailure::Cancelled {
        attempts: max_attempts,
        last_error,
    })
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The result lies between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
