//! Common error types for the BLB controller.
//!
//! This module provides shared error types that are used across multiple crates.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur throughout the controller.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),

    /// A CIDR block could not be parsed.
    #[error("invalid CIDR block {0:?}")]
    InvalidCidr(String),

    /// The address space is exhausted when looking for a free block.
    #[error("no free CIDR block after {0}")]
    CidrExhausted(String),
}
