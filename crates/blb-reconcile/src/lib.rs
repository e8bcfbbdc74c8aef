//! Reconciliation engine for cloud load balancers, elastic IPs and VPC routes.
//!
//! This crate converges remote network resources on the state declared by
//! Kubernetes Service and Node objects:
//!
//! - [`LoadBalancerReconciler`]: `EnsureExists` / `EnsureDeleted` / `Get` for
//!   the load balancer of a Service, driving the subnet, backend, listener
//!   and elastic IP reconcilers in dependency order
//! - [`RouteReconciler`]: per-node pod-CIDR routes, with a background audit
//!   for overlaps with user-managed routes
//! - [`WorkQueue`]: the deduplicating, rate-limited queue the controller's
//!   workers drain
//!
//! Remote state is always re-read before diffing; the only persisted state
//! is the set of identifiers cached in object annotations through an
//! [`AnnotationStore`].
//!
//! # Architecture
//!
//! ```text
//!   Service event                          Node event
//!        │                                      │
//!        ▼                                      ▼
//! ┌──────────────────────┐            ┌──────────────────┐
//! │ LoadBalancerReconciler│            │  RouteReconciler │──┐ spawn
//! └──────────┬───────────┘            └────────┬─────────┘  ▼
//!            │ extract                         │       ┌──────────┐
//!            ├─▶ subnet (create only)          │       │ conflict │
//!            ├─▶ backends                      │       │  audit   │
//!            ├─▶ listeners                     │       └──────────┘
//!            └─▶ elastic IP                    │
//!                     │                        │
//!                     ▼                        ▼
//!          LoadBalancerApi / EipApi / VpcApi / ClusterApi
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use blb_reconcile::{
//!     CloudClients, LoadBalancerReconciler, MemoryAnnotationStore, ReconcilerConfig,
//! };
//! # use k8s_openapi::api::core::v1::Service;
//!
//! # async fn example(
//! #     clients: CloudClients,
//! #     service: Service,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(ReconcilerConfig::from_env()?);
//! let store = Arc::new(MemoryAnnotationStore::new());
//! let reconciler = LoadBalancerReconciler::new(clients, store, config);
//!
//! let ingress = reconciler.ensure_load_balancer(&service, &[]).await?;
//! println!("{} serves {}", ingress.load_balancer_id, ingress.address);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::sync::Arc;

use blb_cloud::{ClusterApi, EipApi, LoadBalancerApi, VpcApi};

pub mod annotations;
pub mod backends;
pub mod config;
pub mod conflict;
pub mod eip;
pub mod error;
pub mod extract;
pub mod lifecycle;
pub mod listeners;
pub mod load_balancer;
pub mod queue;
pub mod retry;
pub mod routes;
pub mod subnet;

pub use annotations::{AnnotationPatch, AnnotationStore, MemoryAnnotationStore, ServiceKey};
pub use config::ReconcilerConfig;
pub use conflict::{EventRecorder, MemoryEventRecorder, RouteConflict, TracingEventRecorder};
pub use error::{ErrorClass, ReconcileError, Result, StepFailure};
pub use extract::{extract, DesiredEipConfig, DesiredLoadBalancerConfig, PortSpec};
pub use lifecycle::LoadBalancerPhase;
pub use load_balancer::{LoadBalancerReconciler, ObservedLoadBalancer, ServiceIngress};
pub use queue::{run_workers, Backoff, WorkQueue};
pub use retry::PollPolicy;
pub use routes::{ManagedRoute, RouteReconciler};

/// Handles to every cloud API the engine consumes.
#[derive(Clone)]
pub struct CloudClients {
    /// Load balancer API.
    pub load_balancers: Arc<dyn LoadBalancerApi>,
    /// Elastic IP API.
    pub eips: Arc<dyn EipApi>,
    /// VPC API.
    pub vpc: Arc<dyn VpcApi>,
    /// Cluster inventory API.
    pub cluster: Arc<dyn ClusterApi>,
}

impl CloudClients {
    /// Use one client implementing every API.
    pub fn from_shared<C>(client: Arc<C>) -> Self
    where
        C: LoadBalancerApi + EipApi + VpcApi + ClusterApi + 'static,
    {
        Self {
            load_balancers: client.clone(),
            eips: client.clone(),
            vpc: client.clone(),
            cluster: client,
        }
    }
}

impl std::fmt::Debug for CloudClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudClients").finish_non_exhaustive()
    }
}
