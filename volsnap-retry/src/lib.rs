//! Retry and backoff logic shared by the volsnap engine
//!
//! Two shapes of retry live here:
//! - [`with_backoff`] / [`with_custom_backoff`] retry a fallible operation
//!   (object-store writes) while its errors are transient.
//! - [`poll_with_backoff`] waits for a condition that becomes true over time
//!   (an asynchronous backend snapshot reaching a terminal state).

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Common retry error types
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Operation '{operation}' exceeded maximum retry attempts ({attempts}): {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        attempts: usize,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Transient error in '{operation}': {source}")]
    Transient {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Operation '{operation}' did not complete after {attempts} polls")]
    TimedOut {
        operation: &'static str,
        attempts: usize,
    },
}

impl RetryError {
    /// Name of the operation that produced this error
    pub fn operation(&self) -> &'static str {
        match self {
            Self::MaxRetriesExceeded { operation, .. }
            | Self::Transient { operation, .. }
            | Self::Permanent { operation, .. }
            | Self::TimedOut { operation, .. } => operation,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// Boxed future for retry operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = RetryResult<T>> + Send + 'a>>;

/// Outcome of a single poll in [`poll_with_backoff`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState<T> {
    /// The awaited condition holds; stop polling with this value
    Ready(T),
    /// Not there yet; poll again after the next delay
    Pending,
}

/// Longest single sleep between polls unless a policy says otherwise
pub const DEFAULT_MAX_POLL_DELAY: Duration = Duration::from_secs(300);

/// Stepped exponential schedule for polling
///
/// The first poll happens immediately; after each unsuccessful poll the delay
/// is multiplied by `factor`, capped at `max_delay`. Polling gives up after
/// `steps` polls.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub initial_delay: Duration,
    pub factor: f64,
    pub steps: usize,
    pub max_delay: Duration,
}

impl PollPolicy {
    pub fn new(initial_delay: Duration, factor: f64, steps: usize) -> Self {
        Self {
            initial_delay,
            factor,
            steps,
            max_delay: DEFAULT_MAX_POLL_DELAY,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay to sleep after the given (1-based) unsuccessful poll
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        // Infinite or out-of-range products fall back to the cap.
        Duration::try_from_secs_f64(secs)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

impl Default for PollPolicy {
    /// 2s initial delay, growing by 1.5x for up to 20 polls
    fn default() -> Self {
        Self::new(Duration::from_secs(2), 1.5, 20)
    }
}

/// Execute an operation with the default exponential backoff policy
pub async fn with_backoff<'a, F, T>(op_name: &'static str, f: F) -> RetryResult<T>
where
    F: FnMut(usize) -> BoxFuture<'a, T>,
{
    with_custom_backoff(op_name, default_backoff_policy(), 3, f).await
}

/// Execute an operation with a custom backoff policy
///
/// Transient errors are retried until either `max_attempts` is reached or the
/// policy runs out of elapsed time. Permanent errors are returned at once.
pub async fn with_custom_backoff<'a, F, T>(
    op_name: &'static str,
    mut policy: ExponentialBackoff,
    max_attempts: usize,
    mut f: F,
) -> RetryResult<T>
where
    F: FnMut(usize) -> BoxFuture<'a, T>,
{
    policy.reset();
    let mut attempt = 1;

    loop {
        debug!("Attempting operation '{}' (attempt {})", op_name, attempt);

        match f(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        "Operation '{}' succeeded after {} attempts",
                        op_name, attempt
                    );
                }
                return Ok(result);
            }
            Err(err @ RetryError::Permanent { .. }) => {
                warn!(
                    "Operation '{}' failed permanently on attempt {}: {}",
                    op_name, attempt, err
                );
                return Err(err);
            }
            Err(err) => {
                warn!(
                    "Operation '{}' failed on attempt {}: {}",
                    op_name, attempt, err
                );

                let delay = match policy.next_backoff() {
                    Some(delay) if attempt < max_attempts => delay,
                    _ => {
                        return Err(RetryError::MaxRetriesExceeded {
                            operation: op_name,
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                };

                attempt += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Poll until the operation reports [`PollState::Ready`]
///
/// Transient errors count as an unsuccessful poll, permanent errors stop
/// polling immediately. Returns [`RetryError::TimedOut`] once the policy's
/// steps are used up.
pub async fn poll_with_backoff<'a, F, T>(
    op_name: &'static str,
    policy: &PollPolicy,
    mut f: F,
) -> RetryResult<T>
where
    F: FnMut(usize) -> BoxFuture<'a, PollState<T>>,
{
    for attempt in 1..=policy.steps {
        match f(attempt).await {
            Ok(PollState::Ready(value)) => {
                debug!("Poll '{}' completed on attempt {}", op_name, attempt);
                return Ok(value);
            }
            Ok(PollState::Pending) => {
                debug!("Poll '{}' still pending on attempt {}", op_name, attempt);
            }
            Err(err @ RetryError::Permanent { .. }) => return Err(err),
            Err(err) => {
                warn!("Poll '{}' failed on attempt {}: {}", op_name, attempt, err);
            }
        }

        if attempt < policy.steps {
            tokio::time::sleep(policy.delay_after(attempt)).await;
        }
    }

    Err(RetryError::TimedOut {
        operation: op_name,
        attempts: policy.steps,
    })
}

/// Default backoff policy for general operations
pub fn default_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(Some(Duration::from_secs(30)))
        .with_multiplier(2.0)
        .build()
}

/// Backoff policy for writes to the object store holding snapshot records
///
/// Write conflicts and API hiccups are common; the window is kept short so a
/// stuck write surfaces on the next reconciler tick instead.
pub fn store_write_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(200))
        .with_max_interval(Duration::from_secs(2))
        .with_max_elapsed_time(Some(Duration::from_secs(15)))
        .with_multiplier(1.5)
        .build()
}

/// Trait for categorizing errors as transient or permanent
#[async_trait]
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Helper macro for creating transient errors
#[macro_export]
macro_rules! transient_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Transient {
            operation: $op,
            source: Box::new($err),
        }
    };
}

/// Helper macro for creating permanent errors
#[macro_export]
macro_rules! permanent_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Permanent {
            operation: $op,
            source: Box::new($err),
        }
    };
}
