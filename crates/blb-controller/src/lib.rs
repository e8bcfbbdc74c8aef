//! Kubernetes controller for cloud load balancers, elastic IPs and pod routes.
//!
//! This crate wires the reconciliation engine to a cluster:
//!
//! - Service and Node watchers feeding deduplicating work queues
//! - A kube-backed [`KubeAnnotationStore`] for the identifiers cached on
//!   objects, and Service status updates with the ingress address
//! - A [`KubeEventRecorder`] turning terminal failures and route conflicts
//!   into `Warning` events
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │Service watcher│   │ Node watcher │
//! └──────┬───────┘   └──┬────────┬──┘
//!        │  ObjectCache │        │
//!        ▼              ▼        ▼
//!   ┌─────────────────────┐ ┌─────────────┐
//!   │  Service WorkQueue  │ │ Route queue │
//!   └─────────┬───────────┘ └──────┬──────┘
//!             ▼                    ▼
//!   LoadBalancerReconciler   RouteReconciler
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod store;

pub use cache::ObjectCache;
pub use config::{credentials_from_env, ControllerConfig};
pub use controller::Controller;
pub use error::{ControllerError, Result};
pub use store::{KubeAnnotationStore, KubeEventRecorder};
