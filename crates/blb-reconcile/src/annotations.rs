//! Annotation keys and the annotation store.
//!
//! Service and Node annotations double as a small key-value store caching
//! the identifiers of remote resources. The keys and their string values are
//! a persisted contract and must not change.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};
use parking_lot::Mutex;

use crate::error::Result;

/// Prefix of every Service annotation.
pub const SERVICE_PREFIX: &str = "service.beta.kubernetes.io/";

/// `"true"` selects internal-address mode.
pub const INTERNAL_VPC: &str = "service.beta.kubernetes.io/cce-load-balancer-internal-vpc";
/// A user-supplied load balancer the controller must never delete.
pub const EXISTING_LOAD_BALANCER_ID: &str = "service.beta.kubernetes.io/cce-load-balancer-exist-id";
/// Cached id of the load balancer the controller created.
pub const LOAD_BALANCER_ID: &str = "service.beta.kubernetes.io/cce-load-balancer-id";
/// Subnet to create the load balancer in.
pub const SUBNET_ID: &str = "service.beta.kubernetes.io/cce-load-balancer-subnet-id";
/// Label selector (`k=v,k2=v2`) restricting backend nodes.
pub const BACKEND_LABEL: &str = "service.beta.kubernetes.io/cce-load-balancer-backend-label";
/// Target number of backends.
pub const MAX_BACKENDS: &str = "service.beta.kubernetes.io/cce-load-balancer-rs-max-num";
/// Elastic IP name.
pub const EIP_NAME: &str = "service.beta.kubernetes.io/cce-elastic-ip-name";
/// `Prepaid` or `Postpaid`.
pub const EIP_PAYMENT_TIMING: &str = "service.beta.kubernetes.io/cce-elastic-ip-payment-timing";
/// `ByTraffic` or `ByBandwidth`.
pub const EIP_BILLING_METHOD: &str = "service.beta.kubernetes.io/cce-elastic-ip-billing-method";
/// Elastic IP bandwidth in Mbps.
pub const EIP_BANDWIDTH: &str = "service.beta.kubernetes.io/cce-elastic-ip-bandwidth-in-mbps";
/// Prepaid reservation in months.
pub const EIP_RESERVATION_LENGTH: &str =
    "service.beta.kubernetes.io/cce-elastic-ip-reservation-length";
/// Record of the address the controller allocated.
pub const AUTO_ADD_EIP: &str = "service.beta.kubernetes.io/cce-auto-add-eip";

/// VPC of the node.
pub const NODE_VPC_ID: &str = "node.alpha.kubernetes.io/vpc-id";
/// Route table holding the node's pod route.
pub const NODE_ROUTE_TABLE_ID: &str = "node.alpha.kubernetes.io/vpc-route-table-id";
/// The node's pod route.
pub const NODE_ROUTE_RULE_ID: &str = "node.alpha.kubernetes.io/vpc-route-rule-id";
/// `"false"` opts the node out of pod routes.
pub const NODE_ADVERTISE_ROUTE: &str = "node.alpha.kubernetes.io/advertise-route";

/// Changes to apply to an annotation map; `None` removes the key.
pub type AnnotationPatch = BTreeMap<String, Option<String>>;

/// Identity of a Service: `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
}

impl ServiceKey {
    /// Create a key.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The key of a Service object.
    #[must_use]
    pub fn of(service: &Service) -> Self {
        Self::new(
            service
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            service.metadata.name.clone().unwrap_or_default(),
        )
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Look up one annotation of a Service.
#[must_use]
pub fn service_annotation<'a>(service: &'a Service, key: &str) -> Option<&'a str> {
    service
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Look up one annotation of a Node.
#[must_use]
pub fn node_annotation<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Keep only the entries of `patch` that would change `current`.
#[must_use]
pub fn effective_patch(
    current: Option<&BTreeMap<String, String>>,
    patch: AnnotationPatch,
) -> AnnotationPatch {
    patch
        .into_iter()
        .filter(|(key, value)| current.and_then(|c| c.get(key)) != value.as_ref())
        .collect()
}

/// The external key-value store backing Service and Node annotations.
#[async_trait]
pub trait AnnotationStore: Send + Sync {
    /// Apply `patch` to a Service's annotations.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Store` if the object store rejects the patch.
    async fn patch_service_annotations(&self, key: &ServiceKey, patch: &AnnotationPatch)
        -> Result<()>;

    /// Apply `patch` to a Node's annotations.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Store` if the object store rejects the patch.
    async fn patch_node_annotations(&self, node: &str, patch: &AnnotationPatch) -> Result<()>;
}

/// An annotation store that keeps everything in memory.
///
/// Every key ever patched is remembered with its latest value (or removal),
/// so the writes can be replayed onto Kubernetes objects in tests.
#[derive(Debug, Default)]
pub struct MemoryAnnotationStore {
    services: Mutex<HashMap<ServiceKey, AnnotationPatch>>,
    nodes: Mutex<HashMap<String, AnnotationPatch>>,
    patches: Mutex<usize>,
}

fn merge(target: &mut AnnotationPatch, patch: &AnnotationPatch) {
    for (key, value) in patch {
        target.insert(key.clone(), value.clone());
    }
}

fn apply(target: &mut BTreeMap<String, String>, patch: &AnnotationPatch) {
    for (key, value) in patch {
        match value {
            Some(v) => {
                target.insert(key.clone(), v.clone());
            }
            None => {
                target.remove(key);
            }
        }
    }
}

fn present(patch: Option<&AnnotationPatch>) -> BTreeMap<String, String> {
    patch
        .into_iter()
        .flatten()
        .filter_map(|(k, v)| v.clone().map(|v| (k.clone(), v)))
        .collect()
}

impl MemoryAnnotationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Annotations currently set on a Service by this store.
    #[must_use]
    pub fn service_annotations(&self, key: &ServiceKey) -> BTreeMap<String, String> {
        present(self.services.lock().get(key))
    }

    /// Annotations currently set on a Node by this store.
    #[must_use]
    pub fn node_annotations(&self, node: &str) -> BTreeMap<String, String> {
        present(self.nodes.lock().get(node))
    }

    /// Number of patches applied.
    #[must_use]
    pub fn patch_count(&self) -> usize {
        *self.patches.lock()
    }

    /// Replay the stored writes onto a Service object, as a watcher would
    /// observe them.
    pub fn apply_to_service(&self, service: &mut Service) {
        let key = ServiceKey::of(service);
        if let Some(patch) = self.services.lock().get(&key) {
            apply(
                service.metadata.annotations.get_or_insert_with(BTreeMap::new),
                patch,
            );
        }
    }

    /// Replay the stored writes onto a Node object.
    pub fn apply_to_node(&self, node: &mut Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        if let Some(patch) = self.nodes.lock().get(&name) {
            apply(node.metadata.annotations.get_or_insert_with(BTreeMap::new), patch);
        }
    }
}

#[async_trait]
impl AnnotationStore for MemoryAnnotationStore {
    async fn patch_service_annotations(
        &self,
        key: &ServiceKey,
        patch: &AnnotationPatch,
    ) -> Result<()> {
        merge(self.services.lock().entry(key.clone()).or_default(), patch);
        *self.patches.lock() += 1;
        Ok(())
    }

    async fn patch_node_annotations(&self, node: &str, patch: &AnnotationPatch) -> Result<()> {
        merge(self.nodes.lock().entry(node.to_string()).or_default(), patch);
        *self.patches.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn service(annotations: &[(&str, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("prod".into()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            ..Service::default()
        }
    }

    #[test]
    fn keys_are_prefixed() {
        for key in [
            INTERNAL_VPC,
            EXISTING_LOAD_BALANCER_ID,
            LOAD_BALANCER_ID,
            SUBNET_ID,
            BACKEND_LABEL,
            MAX_BACKENDS,
            EIP_NAME,
            EIP_PAYMENT_TIMING,
            EIP_BILLING_METHOD,
            EIP_BANDWIDTH,
            EIP_RESERVATION_LENGTH,
            AUTO_ADD_EIP,
        ] {
            assert!(key.starts_with(SERVICE_PREFIX), "{key}");
        }
    }

    #[test]
    fn service_key_display() {
        let svc = service(&[]);
        assert_eq!(ServiceKey::of(&svc).to_string(), "prod/web");
    }

    #[test]
    fn effective_patch_drops_noops() {
        let svc = service(&[(LOAD_BALANCER_ID, "lb-1")]);
        let mut patch = AnnotationPatch::new();
        patch.insert(LOAD_BALANCER_ID.to_string(), Some("lb-1".to_string()));
        patch.insert(AUTO_ADD_EIP.to_string(), None);
        assert!(effective_patch(svc.metadata.annotations.as_ref(), patch).is_empty());

        let mut patch = AnnotationPatch::new();
        patch.insert(LOAD_BALANCER_ID.to_string(), None);
        assert_eq!(effective_patch(svc.metadata.annotations.as_ref(), patch).len(), 1);
    }

    #[tokio::test]
    async fn memory_store_round_trips_into_objects() {
        let store = MemoryAnnotationStore::new();
        let mut svc = service(&[(AUTO_ADD_EIP, "180.76.0.1")]);
        let key = ServiceKey::of(&svc);

        let mut patch = AnnotationPatch::new();
        patch.insert(LOAD_BALANCER_ID.to_string(), Some("lb-1".to_string()));
        patch.insert(AUTO_ADD_EIP.to_string(), None);
        store.patch_service_annotations(&key, &patch).await.unwrap();

        store.apply_to_service(&mut svc);
        assert_eq!(service_annotation(&svc, LOAD_BALANCER_ID), Some("lb-1"));
        assert_eq!(service_annotation(&svc, AUTO_ADD_EIP), None);
        assert_eq!(store.patch_count(), 1);
    }
}
