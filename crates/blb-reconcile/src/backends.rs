//! Backend set reconciliation.
//!
//! Two strategies are supported:
//!
//! - [`reconcile_backends`]: the registered set must equal the desired set
//!   exactly. At most one batch remove and one batch add call are issued.
//! - [`reconcile_backends_bounded`]: only a target *count* matters. Present
//!   backends are preferred to minimize churn, see [`merge_backends`].

use std::collections::{BTreeMap, BTreeSet};

use blb_cloud::{Backend, ClusterNode, LoadBalancerApi};
use blb_core::{InstanceId, LoadBalancerId};
use k8s_openapi::api::core::v1::Node;
use tracing::{debug, info};

use crate::error::Result;

/// Scheme prefix of a node's `spec.providerID`.
pub const PROVIDER_ID_PREFIX: &str = "cce://";

/// Instances to register and deregister.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendChanges {
    /// Instances to register.
    pub to_add: Vec<InstanceId>,
    /// Instances to deregister.
    pub to_remove: Vec<InstanceId>,
}

impl BackendChanges {
    /// Whether nothing needs to change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Exact diff: `to_remove = observed − desired`, `to_add = desired − observed`.
#[must_use]
pub fn diff_backends(observed: &BTreeSet<InstanceId>, desired: &BTreeSet<InstanceId>) -> BackendChanges {
    BackendChanges {
        to_add: desired.difference(observed).cloned().collect(),
        to_remove: observed.difference(desired).cloned().collect(),
    }
}

/// Bounded-selection merge.
///
/// Keeps present backends that are still candidates (in `existing` order) up
/// to `target`, fills the remaining capacity from `candidates` in order, and
/// removes every present backend that is not kept.
#[must_use]
pub fn merge_backends(
    existing: &[InstanceId],
    candidates: &[InstanceId],
    target: usize,
) -> BackendChanges {
    let candidate_set: BTreeSet<&InstanceId> = candidates.iter().collect();
    let mut kept: BTreeSet<&InstanceId> = BTreeSet::new();
    let mut changes = BackendChanges::default();

    for id in existing {
        if candidate_set.contains(id) && kept.len() < target && kept.insert(id) {
            continue;
        }
        if !kept.contains(id) && !changes.to_remove.contains(id) {
            changes.to_remove.push(id.clone());
        }
    }

    for id in candidates {
        if kept.len() >= target {
            break;
        }
        if kept.insert(id) {
            changes.to_add.push(id.clone());
        }
    }

    changes
}

async fn apply_changes(
    api: &dyn LoadBalancerApi,
    id: &LoadBalancerId,
    changes: &BackendChanges,
    weight: u32,
) -> Result<()> {
    if changes.is_empty() {
        debug!(load_balancer_id = %id, "Backends already converged");
        return Ok(());
    }

    if !changes.to_remove.is_empty() {
        info!(load_balancer_id = %id, count = changes.to_remove.len(), "Removing backends");
        api.remove_backends(id, &changes.to_remove).await?;
    }

    if !changes.to_add.is_empty() {
        info!(load_balancer_id = %id, count = changes.to_add.len(), "Adding backends");
        let backends: Vec<Backend> = changes
            .to_add
            .iter()
            .map(|instance_id| Backend {
                instance_id: instance_id.clone(),
                weight,
            })
            .collect();
        api.add_backends(id, &backends).await?;
    }

    Ok(())
}

/// Make the registered backends equal `desired`.
///
/// # Errors
///
/// Returns the first remote error; the caller retries the whole reconciliation.
pub async fn reconcile_backends(
    api: &dyn LoadBalancerApi,
    id: &LoadBalancerId,
    desired: &BTreeSet<InstanceId>,
    weight: u32,
) -> Result<BackendChanges> {
    let observed: BTreeSet<InstanceId> = api
        .describe_backends(id)
        .await?
        .into_iter()
        .map(|b| b.instance_id)
        .collect();

    let changes = diff_backends(&observed, desired);
    apply_changes(api, id, &changes, weight).await?;
    Ok(changes)
}

/// Keep `target` backends drawn from `candidates`, preferring present ones.
///
/// # Errors
///
/// Returns the first remote error.
pub async fn reconcile_backends_bounded(
    api: &dyn LoadBalancerApi,
    id: &LoadBalancerId,
    candidates: &[InstanceId],
    target: usize,
    weight: u32,
) -> Result<BackendChanges> {
    let existing: Vec<InstanceId> = api
        .describe_backends(id)
        .await?
        .into_iter()
        .map(|b| b.instance_id)
        .collect();

    let changes = merge_backends(&existing, candidates, target);
    apply_changes(api, id, &changes, weight).await?;
    Ok(changes)
}

/// Whether the node reports the `Ready` condition as `True`.
#[must_use]
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Whether the node carries every label of `selector`.
#[must_use]
pub fn matches_selector(node: &Node, selector: &BTreeMap<String, String>) -> bool {
    let labels = node.metadata.labels.as_ref();
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

/// The instance id encoded in `spec.providerID`.
#[must_use]
pub fn instance_id_from_provider(node: &Node) -> Option<InstanceId> {
    node.spec
        .as_ref()
        .and_then(|s| s.provider_id.as_deref())
        .and_then(|p| p.strip_prefix(PROVIDER_ID_PREFIX))
        .and_then(|id| InstanceId::new(id).ok())
}

/// The instance backing a node: `spec.providerID` first, then the inventory
/// entry matching the node name or one of its addresses.
#[must_use]
pub fn resolve_instance_id(node: &Node, inventory: &[ClusterNode]) -> Option<InstanceId> {
    if let Some(id) = instance_id_from_provider(node) {
        return Some(id);
    }

    let name = node.metadata.name.as_deref().unwrap_or_default();
    let addresses: Vec<&str> = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(|a| a.iter().map(|addr| addr.address.as_str()).collect())
        .unwrap_or_default();

    inventory
        .iter()
        .find(|inst| {
            inst.matches_node_name(name) || addresses.iter().any(|a| inst.matches_node_name(a))
        })
        .map(|inst| inst.instance_id.clone())
}

/// Whether any eligible node needs the inventory to resolve its instance.
#[must_use]
pub fn needs_inventory(nodes: &[Node]) -> bool {
    nodes.iter().any(|n| instance_id_from_provider(n).is_none())
}

/// Instances of the ready nodes matching `selector`, sorted and deduplicated.
///
/// Nodes whose instance cannot be resolved are skipped.
#[must_use]
pub fn select_backend_instances(
    nodes: &[Node],
    selector: &BTreeMap<String, String>,
    inventory: &[ClusterNode],
) -> Vec<InstanceId> {
    let selected: BTreeSet<InstanceId> = nodes
        .iter()
        .filter(|n| is_node_ready(n) && matches_selector(n, selector))
        .filter_map(|n| {
            let id = resolve_instance_id(n, inventory);
            if id.is_none() {
                debug!(node = ?n.metadata.name, "No instance found for node");
            }
            id
        })
        .collect();
    selected.into_iter().collect()
}
