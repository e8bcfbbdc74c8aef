//! Reconciler configuration.

use std::time::Duration;

use blb_core::ClusterId;

use crate::error::{ReconcileError, Result};
use crate::retry::PollPolicy;

/// Subnet names reused (or created) to host load balancers when the node
/// subnet cannot.
pub const DEFAULT_RESERVED_SUBNET_NAMES: [&str; 2] = ["CCE-Reserve", "系统预留BLB子网"];

/// Weight given to every registered backend.
pub const DEFAULT_BACKEND_WEIGHT: u32 = 100;

/// Configuration for the reconciliation engine.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Cluster the controller manages.
    pub cluster_id: ClusterId,
    /// Waiting for an address to become bindable and a new load balancer to
    /// become available.
    pub poll: PollPolicy,
    /// Retrying subnet creation.
    pub subnet_create: PollPolicy,
    /// Reserved subnet names; the first one names newly created subnets.
    pub reserved_subnet_names: Vec<String>,
    /// Weight of each backend.
    pub backend_weight: u32,
}

impl ReconcilerConfig {
    /// Create a config with default policies.
    #[must_use]
    pub fn new(cluster_id: ClusterId) -> Self {
        Self {
            cluster_id,
            poll: PollPolicy::default(),
            subnet_create: PollPolicy::default(),
            reserved_subnet_names: DEFAULT_RESERVED_SUBNET_NAMES
                .iter()
                .map(ToString::to_string)
                .collect(),
            backend_weight: DEFAULT_BACKEND_WEIGHT,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `CLUSTER_ID`: cluster identifier (required)
    /// - `RESERVED_SUBNET_NAMES`: comma-separated reserved subnet names
    /// - `EIP_BIND_ATTEMPTS`: poll attempts while waiting for an address
    /// - `EIP_BIND_INTERVAL_SECS`: seconds between poll attempts
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Validation` if `CLUSTER_ID` is missing or invalid.
    pub fn from_env() -> Result<Self> {
        let cluster_id = std::env::var("CLUSTER_ID")
            .map_err(|_| ReconcileError::Validation("CLUSTER_ID is not set".to_string()))?;
        let mut config = Self::new(ClusterId::new(cluster_id)?);

        if let Ok(val) = std::env::var("RESERVED_SUBNET_NAMES") {
            let names: Vec<String> = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect();
            if !names.is_empty() {
                config.reserved_subnet_names = names;
            }
        }
        if let Ok(val) = std::env::var("EIP_BIND_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                config.poll.attempts = n;
            }
        }
        if let Ok(val) = std::env::var("EIP_BIND_INTERVAL_SECS") {
            if let Ok(n) = val.parse() {
                config.poll.interval = Duration::from_secs(n);
            }
        }

        Ok(config)
    }

    /// Name given to subnets this controller creates.
    #[must_use]
    pub fn created_subnet_name(&self) -> &str {
        self.reserved_subnet_names
            .first()
            .map_or(DEFAULT_RESERVED_SUBNET_NAMES[0], String::as_str)
    }
}
