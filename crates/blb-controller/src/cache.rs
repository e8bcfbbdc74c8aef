//! Last-seen Services and Nodes, with tombstones for deletion.
//!
//! The reconcilers need the last observed object to tear down what it
//! created, so a Service that is deleted (or stops being of type
//! `LoadBalancer`) is kept as a tombstone until its key has been processed.
//! Nodes leave behind the pod CIDRs they were routed for.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use blb_core::cidr;
use blb_reconcile::annotations::NODE_ADVERTISE_ROUTE;
use blb_reconcile::backends::{instance_id_from_provider, is_node_ready};
use blb_reconcile::{ErrorClass, ServiceKey};
use ipnet::IpNet;
use k8s_openapi::api::core::v1::{Node, Service};
use parking_lot::RwLock;

/// Whether a Service asks for a cloud load balancer.
#[must_use]
pub fn is_load_balancer(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .is_some_and(|t| t == "LoadBalancer")
        && service.metadata.deletion_timestamp.is_none()
}

/// The pod CIDR assigned to a node.
#[must_use]
pub fn pod_cidr(node: &Node) -> Option<IpNet> {
    node.spec
        .as_ref()
        .and_then(|s| s.pod_cidr.as_deref())
        .and_then(|raw| cidr::parse(raw).ok())
}

/// The parts of a Node that influence backend selection.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NodeFingerprint {
    ready: bool,
    labels: BTreeMap<String, String>,
    provider_id: Option<String>,
    advertise_route: Option<String>,
}

impl NodeFingerprint {
    fn of(node: &Node) -> Self {
        Self {
            ready: is_node_ready(node),
            labels: node.metadata.labels.clone().unwrap_or_default(),
            provider_id: instance_id_from_provider(node).map(|id| id.to_string()),
            advertise_route: node
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(NODE_ADVERTISE_ROUTE).cloned()),
        }
    }
}

/// What a Node update requires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeChange {
    /// Backend membership may have changed; every load balancer must be synced.
    pub backends: bool,
    /// The node's routes must be synced.
    pub route: bool,
}

#[derive(Default)]
struct State {
    services: HashMap<ServiceKey, Service>,
    tombstones: HashMap<ServiceKey, Service>,
    nodes: BTreeMap<String, Node>,
    fingerprints: HashMap<String, NodeFingerprint>,
    retired_cidrs: HashMap<String, BTreeSet<IpNet>>,
}

/// Thread-safe store of the objects the watchers observed.
#[derive(Default)]
pub struct ObjectCache {
    state: RwLock<State>,
}

/// What a queued Service key resolves to.
#[derive(Debug, Clone)]
pub enum ServiceTarget {
    /// Converge the load balancer on this Service.
    Ensure(Service),
    /// Tear down what was created for this last-seen Service.
    Delete(Service),
    /// Nothing to do.
    Skip,
}

impl ObjectCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an added or updated Service.
    ///
    /// Returns whether the key needs processing.
    pub fn apply_service(&self, service: Service) -> bool {
        let key = ServiceKey::of(&service);
        let mut state = self.state.write();
        if is_load_balancer(&service) {
            state.tombstones.remove(&key);
            state.services.insert(key, service);
            return true;
        }
        // Type changed away from LoadBalancer (or deletion started).
        match state.services.remove(&key) {
            Some(previous) => {
                state.tombstones.insert(key, tombstone(previous, &service));
                true
            }
            None => state.tombstones.contains_key(&key),
        }
    }

    /// Record a deleted Service. Returns whether the key needs processing.
    pub fn delete_service(&self, service: Service) -> bool {
        let key = ServiceKey::of(&service);
        let mut state = self.state.write();
        match state.services.remove(&key) {
            Some(previous) => {
                state.tombstones.insert(key, tombstone(previous, &service));
                true
            }
            None if service_type_is_load_balancer(&service) => {
                state.tombstones.insert(key, service);
                true
            }
            None => false,
        }
    }

    /// Resolve a queued key.
    #[must_use]
    pub fn service_target(&self, key: &ServiceKey) -> ServiceTarget {
        let state = self.state.read();
        if let Some(service) = state.services.get(key) {
            return ServiceTarget::Ensure(service.clone());
        }
        if let Some(service) = state.tombstones.get(key) {
            return ServiceTarget::Delete(service.clone());
        }
        ServiceTarget::Skip
    }

    /// Drop the tombstone once teardown has converged.
    pub fn forget_tombstone(&self, key: &ServiceKey) {
        self.state.write().tombstones.remove(key);
    }

    /// Settle a teardown attempt. The tombstone is kept only after a
    /// retryable failure.
    ///
    /// Returns whether the tombstone was dropped.
    pub fn settle_teardown(&self, key: &ServiceKey, failure: Option<ErrorClass>) -> bool {
        if failure == Some(ErrorClass::Retryable) {
            return false;
        }
        self.forget_tombstone(key);
        true
    }

    /// Keys of every live load balancer Service.
    #[must_use]
    pub fn service_keys(&self) -> Vec<ServiceKey> {
        let state = self.state.read();
        state.services.keys().cloned().collect()
    }

    /// Record an added or updated Node.
    pub fn apply_node(&self, node: Node) -> NodeChange {
        let Some(name) = node.metadata.name.clone() else {
            return NodeChange::default();
        };
        let fingerprint = NodeFingerprint::of(&node);
        let mut state = self.state.write();

        let previous_cidr = state.nodes.get(&name).and_then(pod_cidr);
        let current_cidr = pod_cidr(&node);
        let mut route = previous_cidr != current_cidr
            || state.fingerprints.get(&name).map(|f| &f.advertise_route)
                != Some(&fingerprint.advertise_route);
        if let Some(old) = previous_cidr.filter(|old| Some(*old) != current_cidr) {
            state.retired_cidrs.entry(name.clone()).or_default().insert(old);
            route = true;
        }

        let backends = state.fingerprints.get(&name) != Some(&fingerprint);
        state.fingerprints.insert(name.clone(), fingerprint);
        state.nodes.insert(name, node);
        NodeChange { backends, route }
    }

    /// Record a deleted Node.
    pub fn delete_node(&self, node: &Node) -> NodeChange {
        let Some(name) = node.metadata.name.clone() else {
            return NodeChange::default();
        };
        let mut state = self.state.write();
        let last = state.nodes.remove(&name);
        state.fingerprints.remove(&name);
        let cidr = last.as_ref().and_then(pod_cidr).or_else(|| pod_cidr(node));
        if let Some(cidr) = cidr {
            state.retired_cidrs.entry(name).or_default().insert(cidr);
        }
        NodeChange {
            backends: true,
            route: true,
        }
    }

    /// A node by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<Node> {
        self.state.read().nodes.get(name).cloned()
    }

    /// Every known node.
    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        self.state.read().nodes.values().cloned().collect()
    }

    /// Pod CIDRs a node no longer owns.
    #[must_use]
    pub fn retired_cidrs(&self, name: &str) -> Vec<IpNet> {
        self.state
            .read()
            .retired_cidrs
            .get(name)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Mark a retired CIDR as cleaned up.
    pub fn forget_retired_cidr(&self, name: &str, cidr: &IpNet) {
        let mut state = self.state.write();
        if let Some(set) = state.retired_cidrs.get_mut(name) {
            set.remove(cidr);
            if set.is_empty() {
                state.retired_cidrs.remove(name);
            }
        }
    }
}

fn service_type_is_load_balancer(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .is_some_and(|t| t == "LoadBalancer")
}

/// The object used for teardown: the newest one carrying the cached ids.
fn tombstone(previous: Service, latest: &Service) -> Service {
    let mut merged = latest.clone();
    let mut annotations = previous.metadata.annotations.unwrap_or_default();
    annotations.extend(latest.metadata.annotations.clone().unwrap_or_default());
    merged.metadata.annotations = Some(annotations);
    if merged.status.is_none() {
        merged.status = previous.status;
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use blb_reconcile::annotations::LOAD_BALANCER_ID;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeSpec, NodeStatus, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn service(type_: &str, annotations: &[(&str, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some("shop".into()),
                name: Some("web".into()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(type_.into()),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    fn node(name: &str, cidr: Option<&str>, ready: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..ObjectMeta::default()
            },
            spec: Some(NodeSpec {
                pod_cidr: cidr.map(Into::into),
                provider_id: Some(format!("cce://i-{name}")),
                ..NodeSpec::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: if ready { "True" } else { "False" }.into(),
                    ..NodeCondition::default()
                }]),
                ..NodeStatus::default()
            }),
        }
    }

    fn key() -> ServiceKey {
        ServiceKey::new("shop", "web")
    }

    #[test]
    fn cluster_ip_services_are_ignored() {
        let cache = ObjectCache::new();
        assert!(!cache.apply_service(service("ClusterIP", &[])));
        assert!(matches!(cache.service_target(&key()), ServiceTarget::Skip));
        assert!(!cache.delete_service(service("ClusterIP", &[])));
    }

    #[test]
    fn deletion_keeps_last_seen_annotations() {
        let cache = ObjectCache::new();
        assert!(cache.apply_service(service("LoadBalancer", &[(LOAD_BALANCER_ID, "lb-1")])));
        assert!(matches!(cache.service_target(&key()), ServiceTarget::Ensure(_)));

        assert!(cache.delete_service(service("LoadBalancer", &[])));
        let ServiceTarget::Delete(tombstone) = cache.service_target(&key()) else {
            panic!("expected a tombstone");
        };
        assert_eq!(
            tombstone
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(LOAD_BALANCER_ID))
                .map(String::as_str),
            Some("lb-1")
        );

        cache.forget_tombstone(&key());
        assert!(matches!(cache.service_target(&key()), ServiceTarget::Skip));
    }

    #[test]
    fn terminal_teardown_failure_drops_tombstone() {
        let cache = ObjectCache::new();
        cache.apply_service(service("LoadBalancer", &[(LOAD_BALANCER_ID, "lb-1")]));
        cache.delete_service(service("LoadBalancer", &[]));

        assert!(!cache.settle_teardown(&key(), Some(ErrorClass::Retryable)));
        assert!(matches!(cache.service_target(&key()), ServiceTarget::Delete(_)));

        assert!(cache.settle_teardown(&key(), Some(ErrorClass::Terminal)));
        assert!(matches!(cache.service_target(&key()), ServiceTarget::Skip));
        // A later resync of the same key has nothing left to tear down.
        assert!(!cache.apply_service(service("NodePort", &[])));
    }

    #[test]
    fn successful_teardown_drops_tombstone() {
        let cache = ObjectCache::new();
        cache.apply_service(service("LoadBalancer", &[]));
        cache.apply_service(service("NodePort", &[]));
        assert!(cache.settle_teardown(&key(), None));
        assert!(matches!(cache.service_target(&key()), ServiceTarget::Skip));
    }

    #[test]
    fn type_change_creates_tombstone() {
        let cache = ObjectCache::new();
        cache.apply_service(service("LoadBalancer", &[]));
        assert!(cache.apply_service(service("NodePort", &[])));
        assert!(matches!(cache.service_target(&key()), ServiceTarget::Delete(_)));
        assert!(cache.service_keys().is_empty());

        assert!(cache.apply_service(service("LoadBalancer", &[])));
        assert!(matches!(cache.service_target(&key()), ServiceTarget::Ensure(_)));
    }

    #[test]
    fn node_heartbeats_do_not_resync_backends() {
        let cache = ObjectCache::new();
        let first = cache.apply_node(node("a", Some("172.16.0.0/24"), true));
        assert!(first.backends);
        assert!(first.route);

        let again = cache.apply_node(node("a", Some("172.16.0.0/24"), true));
        assert_eq!(again, NodeChange::default());

        let unready = cache.apply_node(node("a", Some("172.16.0.0/24"), false));
        assert!(unready.backends);
        assert!(!unready.route);
    }

    #[test]
    fn cidr_change_retires_old_block() {
        let cache = ObjectCache::new();
        cache.apply_node(node("a", Some("172.16.0.0/24"), true));
        let change = cache.apply_node(node("a", Some("172.16.1.0/24"), true));
        assert!(change.route);

        let old: IpNet = "172.16.0.0/24".parse().unwrap();
        assert_eq!(cache.retired_cidrs("a"), vec![old]);
        cache.forget_retired_cidr("a", &old);
        assert!(cache.retired_cidrs("a").is_empty());
    }

    #[test]
    fn deleted_node_retires_its_cidr() {
        let cache = ObjectCache::new();
        let n = node("a", Some("172.16.0.0/24"), true);
        cache.apply_node(n.clone());

        let change = cache.delete_node(&n);
        assert!(change.backends && change.route);
        assert!(cache.node("a").is_none());
        assert_eq!(cache.retired_cidrs("a").len(), 1);
        assert!(cache.nodes().is_empty());
    }
}
