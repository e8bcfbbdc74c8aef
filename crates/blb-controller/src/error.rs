//! Error types for the controller crate.

use blb_cloud::CloudError;
use blb_reconcile::ReconcileError;
use thiserror::Error;

/// Errors that can occur while running the controller.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),

    /// Cloud client error.
    #[error("Cloud client error: {0}")]
    Cloud(#[from] CloudError),

    /// Reconciliation error.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ControllerError {
    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::KubeApi(_) => true,
            Self::Cloud(e) => e.is_retriable(),
            Self::Reconcile(e) => e.is_retriable(),
            Self::Config(_) => false,
        }
    }
}

impl From<ControllerError> for ReconcileError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::Reconcile(e) => e,
            ControllerError::Cloud(e) => Self::Cloud(e),
            ControllerError::KubeApi(e) => Self::Store(e.to_string()),
            ControllerError::Config(msg) => Self::Validation(msg),
        }
    }
}

/// A specialized Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_follows_wrapped_error() {
        assert!(ControllerError::Reconcile(ReconcileError::Transient("busy".into())).is_retriable());
        assert!(!ControllerError::Reconcile(ReconcileError::Validation("bad".into())).is_retriable());
        assert!(!ControllerError::Config("missing".into()).is_retriable());
    }

    #[test]
    fn converts_into_reconcile_error() {
        let err: ReconcileError = ControllerError::Config("WORKERS must be positive".into()).into();
        assert!(matches!(err, ReconcileError::Validation(_)));
    }
}
