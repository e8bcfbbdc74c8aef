//! Error types for the cloud API crate.

use thiserror::Error;

/// Errors returned by the cloud vendor APIs.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The addressed resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The request conflicts with the resource's current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A transient failure (throttling or server error).
    #[error("transient failure (HTTP {status}): {message}")]
    Transient {
        /// HTTP status returned by the vendor.
        status: u16,
        /// Vendor message.
        message: String,
    },

    /// The vendor rejected the request.
    #[error("request rejected (HTTP {status}, {code}): {message}")]
    Rejected {
        /// HTTP status returned by the vendor.
        status: u16,
        /// Vendor error code.
        code: String,
        /// Vendor message.
        message: String,
    },

    /// The operation is not implemented for this kind of resource.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// No usable credentials.
    #[error("credentials unavailable: {0}")]
    Credentials(String),

    /// Transport-level HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The response body could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl CloudError {
    /// Whether the error means the resource is absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error is retriable.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Http(_) | Self::Credentials(_))
    }

    /// Map an HTTP error status and vendor error body to an error.
    #[must_use]
    pub fn from_status(status: u16, code: String, message: String) -> Self {
        match status {
            404 => Self::NotFound(message),
            409 => Self::Conflict(message),
            429 | 500..=599 => Self::Transient { status, message },
            _ => Self::Rejected {
                status,
                code,
                message,
            },
        }
    }
}

/// A specialized Result type for cloud operations.
pub type Result<T> = std::result::Result<T, CloudError>;
