//! Error types for the reconciliation engine.
//!
//! Every failure is classified as [`ErrorClass::Retryable`] or
//! [`ErrorClass::Terminal`]; the work queue owns the backoff policy and only
//! re-queues retryable failures.

use std::fmt;

use blb_cloud::CloudError;
use thiserror::Error;

/// A result type using `ReconcileError`.
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// How the caller should react to a failed reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Re-queue with backoff.
    Retryable,
    /// Surface to the Service owner; retrying unchanged input cannot help.
    Terminal,
}

/// Errors that can occur while reconciling.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The desired state derived from the Service is malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A resource the reconciliation depends on does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent mutation or an unsupported state transition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A transient failure outside the cloud API.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The operation is not implemented for this kind of resource.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A cloud API call failed.
    #[error("cloud API error: {0}")]
    Cloud(#[from] CloudError),

    /// The annotation store failed.
    #[error("annotation store error: {0}")]
    Store(String),

    /// A bounded poll or retry loop ran out of attempts.
    #[error("{operation} did not complete after {attempts} attempts")]
    Timeout {
        /// What was being waited for.
        operation: String,
        /// Attempts made.
        attempts: u32,
    },

    /// Some steps converged and others failed.
    #[error("partial convergence: {}", StepFailures(.0))]
    Partial(Vec<StepFailure>),
}

/// One failed step of a multi-step reconciliation.
#[derive(Debug)]
pub struct StepFailure {
    /// The step that failed, e.g. `listeners`.
    pub step: &'static str,
    /// Why it failed.
    pub error: ReconcileError,
}

struct StepFailures<'a>(&'a [StepFailure]);

impl fmt::Display for StepFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", failure.step, failure.error)?;
        }
        Ok(())
    }
}

impl ReconcileError {
    /// Classify the error for the work queue.
    #[must_use]
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Transient(_) | Self::Store(_) => ErrorClass::Retryable,
            Self::Cloud(e) if e.is_retriable() => ErrorClass::Retryable,
            Self::Partial(failures)
                if failures
                    .iter()
                    .any(|f| f.error.classify() == ErrorClass::Retryable) =>
            {
                ErrorClass::Retryable
            }
            _ => ErrorClass::Terminal,
        }
    }

    /// Returns true if re-queueing might resolve the error.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        self.classify() == ErrorClass::Retryable
    }

    /// Whether the error means a remote resource is absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Cloud(CloudError::NotFound(_)))
    }

    /// Short machine-readable reason, used for Kubernetes events.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "InvalidLoadBalancerConfig",
            Self::NotFound(_) => "ResourceNotFound",
            Self::Conflict(_) => "ResourceConflict",
            Self::Unsupported(_) => "UnsupportedOperation",
            Self::Timeout { .. } => "ResourceStuck",
            Self::Partial(_) => "PartiallyReconciled",
            Self::Transient(_) | Self::Cloud(_) | Self::Store(_) => "SyncLoadBalancerFailed",
        }
    }
}

impl From<blb_core::CoreError> for ReconcileError {
    fn from(err: blb_core::CoreError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<blb_core::IdError> for ReconcileError {
    fn from(err: blb_core::IdError) -> Self {
        Self::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> CloudError {
        CloudError::Transient {
            status: 503,
            message: "busy".into(),
        }
    }

    #[test]
    fn classification() {
        assert_eq!(
            ReconcileError::Validation("no ports".into()).classify(),
            ErrorClass::Terminal
        );
        assert_eq!(
            ReconcileError::Conflict("billing".into()).classify(),
            ErrorClass::Terminal
        );
        assert_eq!(
            ReconcileError::Timeout {
                operation: "eip bind".into(),
                attempts: 10
            }
            .classify(),
            ErrorClass::Terminal
        );
        assert_eq!(
            ReconcileError::Cloud(transient()).classify(),
            ErrorClass::Retryable
        );
        assert_eq!(
            ReconcileError::Cloud(CloudError::NotFound("x".into())).classify(),
            ErrorClass::Terminal
        );
        assert!(ReconcileError::Store("patch failed".into()).is_retriable());
    }

    #[test]
    fn partial_is_retryable_if_any_step_is() {
        let err = ReconcileError::Partial(vec![
            StepFailure {
                step: "listeners",
                error: ReconcileError::Unsupported("HTTP listener on port 80".into()),
            },
            StepFailure {
                step: "address",
                error: ReconcileError::Cloud(transient()),
            },
        ]);
        assert!(err.is_retriable());

        let message = err.to_string();
        assert!(message.contains("listeners: unsupported operation"));
        assert!(message.contains("; address: cloud API error"));

        let err = ReconcileError::Partial(vec![StepFailure {
            step: "listeners",
            error: ReconcileError::Unsupported("HTTP".into()),
        }]);
        assert_eq!(err.classify(), ErrorClass::Terminal);
    }

    #[test]
    fn not_found_detection() {
        assert!(ReconcileError::NotFound("lb".into()).is_not_found());
        assert!(ReconcileError::Cloud(CloudError::NotFound("lb".into())).is_not_found());
        assert!(!ReconcileError::Cloud(transient()).is_not_found());
    }
}
