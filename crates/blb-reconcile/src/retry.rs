//! Bounded fixed-interval polling and retry.
//!
//! Waiting for an elastic IP to become bindable and creating a subnet both
//! use a fixed number of attempts with a fixed pause between them. Exceeding
//! the budget yields [`ReconcileError::Timeout`], a terminal error.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ReconcileError, Result};

/// A fixed number of attempts with a fixed pause between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Maximum number of attempts (at least one is always made).
    pub attempts: u32,
    /// Pause between attempts.
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(3),
        }
    }
}

impl PollPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

/// Poll `check` until it yields `Some`.
///
/// Errors from `check` abort the loop immediately.
///
/// # Errors
///
/// Returns `ReconcileError::Timeout` if every attempt yields `None`.
pub async fn poll_until<F, Fut, T>(policy: PollPolicy, operation: &str, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        if let Some(value) = check().await? {
            return Ok(value);
        }

        debug!(operation = %operation, attempt, "Not ready yet");
        if attempt < attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    warn!(operation = %operation, attempts, "Gave up waiting");
    Err(ReconcileError::Timeout {
        operation: operation.to_string(),
        attempts,
    })
}

/// Run `operation` until it succeeds, retrying retriable failures.
///
/// Non-retriable errors are returned as-is.
///
/// # Errors
///
/// Returns `ReconcileError::Timeout` once the attempts are exhausted.
pub async fn retry_fixed<F, Fut, T>(policy: PollPolicy, operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() && attempt < attempts => {
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = policy.interval.as_millis(),
                    "Operation failed, retrying"
                );
                tokio::time::sleep(policy.interval).await;
            }
            Err(e) if e.is_retriable() => {
                warn!(operation = %operation_name, attempt, error = %e, "Operation failed after max retries");
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Err(ReconcileError::Timeout {
        operation: operation_name.to_string(),
        attempts,
    })
}
