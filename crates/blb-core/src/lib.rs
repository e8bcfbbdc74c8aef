//! Core types and utilities for the BLB controller.
//!
//! This crate provides the foundational types shared by the cloud client and
//! the reconciliation engine:
//!
//! - **Identifiers**: Strongly-typed IDs for clusters, load balancers,
//!   instances, VPCs, subnets and route-table entries
//! - **CIDR arithmetic**: Overlap checks and next-block computation used by
//!   subnet allocation and route conflict detection
//! - **Error types**: Common error definitions shared across crates
//!
//! # Example
//!
//! ```
//! use blb_core::{cidr, InstanceId, LoadBalancerId};
//!
//! let lb = LoadBalancerId::new("lb-8a3f2c").unwrap();
//! let instance = InstanceId::new("i-Zx91ab").unwrap();
//! assert_eq!(lb.as_str(), "lb-8a3f2c");
//! assert_eq!(instance.to_string(), "i-Zx91ab");
//!
//! let subnet = "192.168.0.0/24".parse().unwrap();
//! let next = cidr::next_block(&subnet).unwrap();
//! assert_eq!(next.to_string(), "192.168.1.0/24");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cidr;
pub mod error;
pub mod ids;

pub use error::{CoreError, Result};
pub use ids::{
    ClientToken, ClusterId, IdError, InstanceId, LoadBalancerId, RouteRuleId, RouteTableId,
    SubnetId, VpcId,
};
