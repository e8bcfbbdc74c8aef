//! Typed cloud vendor APIs for the BLB controller.
//!
//! This crate provides the collaborator interfaces the reconciliation engine
//! consumes, including:
//!
//! - [`LoadBalancerApi`], [`EipApi`], [`VpcApi`] and [`ClusterApi`] traits
//! - Typed records for load balancers, listeners, backends, elastic IPs,
//!   subnets and route tables
//! - An injected [`CredentialProvider`] with lazy token refresh
//! - [`HttpCloudClient`], a reqwest implementation of every trait
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌───────────────────────────────┐
//! │  Reconcilers     │────▶│  LoadBalancerApi / EipApi /   │
//! │                  │     │  VpcApi / ClusterApi (traits) │
//! └──────────────────┘     └───────────────┬───────────────┘
//!                                          │
//!                          ┌───────────────▼───────────────┐
//!                          │  HttpCloudClient              │
//!                          │  (or MockCloud in tests)      │
//!                          └───────────────┬───────────────┘
//!                                          │ HTTPS + token
//!                          ┌───────────────▼───────────────┐
//!                          │  Vendor endpoints             │
//!                          └───────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use blb_cloud::{CloudConfig, HttpCloudClient, LoadBalancerApi, StaticCredentialProvider};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CloudConfig::for_region("bj");
//! let client = HttpCloudClient::new(config, Arc::new(StaticCredentialProvider::new("token")))?;
//!
//! let found = client.describe_load_balancers_by_name("c-1/default/web").await?;
//! println!("{} load balancers", found.len());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod api;
pub mod client;
pub mod credentials;
pub mod error;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use api::{ClusterApi, EipApi, LoadBalancerApi, VpcApi};
pub use client::HttpCloudClient;
pub use credentials::{CredentialProvider, FileCredentialProvider, StaticCredentialProvider, Token};
pub use error::{CloudError, Result};
pub use types::{
    Backend, Billing, BillingMethod, ClusterNode, CreateEipArgs, CreateLoadBalancerArgs,
    CreateRouteRuleArgs, CreateSubnetArgs, Eip, EipStatus, InstanceStatus, Listener,
    LoadBalancer, LoadBalancerStatus, NextHopType, PaymentTiming, Protocol, Reservation,
    RouteRule, RouteTable, Subnet, SubnetType, UpdateLoadBalancerArgs,
};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockCall, MockCloud};

/// Endpoints and transport settings for the vendor APIs.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Region the cluster runs in (e.g. `bj`).
    pub region: String,
    /// Base URL of the load balancer API.
    pub blb_endpoint: String,
    /// Base URL of the elastic IP API.
    pub eip_endpoint: String,
    /// Base URL of the VPC API.
    pub vpc_endpoint: String,
    /// Base URL of the cluster inventory API.
    pub cluster_endpoint: String,
    /// Per-request timeout, in seconds.
    pub request_timeout_seconds: u64,
    /// JSON token file for [`FileCredentialProvider`]; `None` uses a static token.
    pub credentials_file: Option<std::path::PathBuf>,
}

impl CloudConfig {
    /// Default endpoints for a region.
    #[must_use]
    pub fn for_region(region: impl Into<String>) -> Self {
        let region = region.into();
        Self {
            blb_endpoint: format!("https://blb.{region}.baidubce.com"),
            eip_endpoint: format!("https://eip.{region}.baidubce.com"),
            vpc_endpoint: format!("https://bcc.{region}.baidubce.com"),
            cluster_endpoint: format!("https://cce.{region}.baidubce.com"),
            region,
            request_timeout_seconds: 30,
            credentials_file: None,
        }
    }

    /// Route every API to one base URL (useful for gateways and tests).
    #[must_use]
    pub fn with_single_endpoint(region: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            region: region.into(),
            blb_endpoint: base_url.clone(),
            eip_endpoint: base_url.clone(),
            vpc_endpoint: base_url.clone(),
            cluster_endpoint: base_url,
            request_timeout_seconds: 30,
            credentials_file: None,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `CLOUD_REGION`: region (default `bj`)
    /// - `BLB_ENDPOINT`, `EIP_ENDPOINT`, `VPC_ENDPOINT`, `CLUSTER_ENDPOINT`: endpoint overrides
    /// - `CLOUD_REQUEST_TIMEOUT_SECONDS`: per-request timeout
    /// - `CLOUD_CREDENTIALS_FILE`: path of the JSON token file
    #[must_use]
    pub fn from_env() -> Self {
        let region = std::env::var("CLOUD_REGION").unwrap_or_else(|_| "bj".to_string());
        let mut config = Self::for_region(region);

        if let Ok(val) = std::env::var("BLB_ENDPOINT") {
            config.blb_endpoint = val;
        }
        if let Ok(val) = std::env::var("EIP_ENDPOINT") {
            config.eip_endpoint = val;
        }
        if let Ok(val) = std::env::var("VPC_ENDPOINT") {
            config.vpc_endpoint = val;
        }
        if let Ok(val) = std::env::var("CLUSTER_ENDPOINT") {
            config.cluster_endpoint = val;
        }
        if let Ok(val) = std::env::var("CLOUD_REQUEST_TIMEOUT_SECONDS") {
            if let Ok(n) = val.parse() {
                config.request_timeout_seconds = n;
            }
        }
        if let Ok(val) = std::env::var("CLOUD_CREDENTIALS_FILE") {
            config.credentials_file = Some(val.into());
        }

        config
    }
}
