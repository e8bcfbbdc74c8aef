//! Load balancer lifecycle state machine.
//!
//! The phase of a Service's load balancer is derived from whether an
//! identifier is remembered in its annotations.
//!
//! # State Machine
//!
//! ```text
//!     ┌──────────┐   ensure    ┌──────────┐  ready   ┌─────────┐
//!     │ NoRecord │────────────▶│ Creating │─────────▶│  Bound  │◀─┐
//!     └──────────┘             └────┬─────┘          └────┬────┘  │ converged
//!          ▲                        │                     │ ensure│
//!          │                        │                     ▼       │
//!          │                        │               ┌──────────┐  │
//!          │                        │               │ Updating │──┘
//!          │                        │               └────┬─────┘
//!          │                        ▼ delete              │ delete
//!          │                   ┌──────────┐               │
//!          └───────────────────│ Deleting │◀──────────────┘
//!                              └──────────┘
//! ```

use std::fmt;

use crate::annotations::ServiceKey;
use crate::error::{ReconcileError, Result};

/// Lifecycle phase of a Service's load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadBalancerPhase {
    /// No load balancer is remembered.
    NoRecord,
    /// A load balancer is being found or created.
    Creating,
    /// A load balancer is remembered and converged.
    Bound,
    /// A remembered load balancer is being reconciled.
    Updating,
    /// The load balancer and its address are being released.
    Deleting,
}

impl fmt::Display for LoadBalancerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoRecord => "NoRecord",
            Self::Creating => "Creating",
            Self::Bound => "Bound",
            Self::Updating => "Updating",
            Self::Deleting => "Deleting",
        };
        f.write_str(s)
    }
}

impl LoadBalancerPhase {
    /// The phase implied by a remembered identifier.
    #[must_use]
    pub const fn from_record(has_identifier: bool) -> Self {
        if has_identifier {
            Self::Bound
        } else {
            Self::NoRecord
        }
    }
}

/// Check if a phase transition is valid according to the state machine.
#[must_use]
pub const fn is_valid_transition(from: LoadBalancerPhase, to: LoadBalancerPhase) -> bool {
    use LoadBalancerPhase::{Bound, Creating, Deleting, NoRecord, Updating};

    matches!(
        (from, to),
        (NoRecord, Creating)
            | (Creating | Updating, Bound)
            | (Bound, Updating)
            // A remembered id whose load balancer vanished is recreated
            | (Updating, Creating)
            | (NoRecord | Creating | Bound | Updating, Deleting)
            | (Deleting, NoRecord)
    )
}

/// Validates a phase transition and returns the target phase if valid.
///
/// # Errors
///
/// Returns `ReconcileError::Conflict` if the transition is not allowed.
pub fn validate_transition(
    service: &ServiceKey,
    from: LoadBalancerPhase,
    to: LoadBalancerPhase,
) -> Result<LoadBalancerPhase> {
    if is_valid_transition(from, to) {
        tracing::debug!(service = %service, from = %from, to = %to, "Load balancer phase transition");
        Ok(to)
    } else {
        Err(ReconcileError::Conflict(format!(
            "service {service}: cannot transition from {from} to {to}"
        )))
    }
}
