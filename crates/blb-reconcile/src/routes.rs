//! Pod-CIDR routes in the VPC route table.
//!
//! Every node owns one route sending its pod CIDR to its instance. Routes are
//! keyed by destination: a destination is routed to one node at a time.

use std::sync::Arc;

use blb_cloud::{
    ClusterApi, ClusterNode, CreateRouteRuleArgs, NextHopType, RouteRule, RouteTable, VpcApi,
};
use blb_core::{cidr, ClientToken, InstanceId, RouteRuleId, VpcId};
use ipnet::IpNet;
use k8s_openapi::api::core::v1::Node;
use tracing::{debug, info, warn};

use crate::annotations::{
    effective_patch, node_annotation, AnnotationPatch, AnnotationStore, NODE_ADVERTISE_ROUTE,
    NODE_ROUTE_RULE_ID, NODE_ROUTE_TABLE_ID, NODE_VPC_ID,
};
use crate::backends::resolve_instance_id;
use crate::config::ReconcilerConfig;
use crate::conflict::{audit_routes, EventRecorder, ROUTE_DESCRIPTION_MARKER};
use crate::error::{ReconcileError, Result};

/// A pod route as seen by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedRoute {
    /// Route-table entry.
    pub rule_id: RouteRuleId,
    /// Pod CIDR.
    pub destination: IpNet,
    /// Instance the route points at.
    pub next_hop: String,
    /// Node owning the instance, if it is still in the cluster.
    pub node_name: Option<String>,
    /// The owner no longer advertises the route; treat it as withdrawn.
    pub blackhole: bool,
}

/// Whether a node advertises its pod route.
#[must_use]
pub fn advertises_route(node: &Node) -> bool {
    node_annotation(node, NODE_ADVERTISE_ROUTE) != Some("false")
}

fn is_pod_route(rule: &RouteRule) -> bool {
    rule.next_hop_type == NextHopType::Custom && cidr::is_default_route(&rule.source)
}

/// Reconciles per-node pod routes.
pub struct RouteReconciler {
    vpc: Arc<dyn VpcApi>,
    cluster: Arc<dyn ClusterApi>,
    store: Arc<dyn AnnotationStore>,
    recorder: Arc<dyn EventRecorder>,
    config: Arc<ReconcilerConfig>,
}

impl RouteReconciler {
    /// Create a reconciler.
    pub fn new(
        vpc: Arc<dyn VpcApi>,
        cluster: Arc<dyn ClusterApi>,
        store: Arc<dyn AnnotationStore>,
        recorder: Arc<dyn EventRecorder>,
        config: Arc<ReconcilerConfig>,
    ) -> Self {
        Self {
            vpc,
            cluster,
            store,
            recorder,
            config,
        }
    }

    async fn inventory(&self) -> Result<Vec<ClusterNode>> {
        Ok(self.cluster.list_nodes(&self.config.cluster_id).await?)
    }

    /// The cluster's VPC: a cached node annotation wins over the inventory.
    fn vpc_of(nodes: &[Node], inventory: &[ClusterNode]) -> Option<VpcId> {
        nodes
            .iter()
            .find_map(|n| node_annotation(n, NODE_VPC_ID).and_then(|v| VpcId::new(v).ok()))
            .or_else(|| inventory.first().map(|n| n.vpc_id.clone()))
    }

    /// The route table for a node, preferring its cached annotation.
    async fn route_table(&self, vpc: &VpcId, node: Option<&Node>) -> Result<RouteTable> {
        let mut tables = self.vpc.list_route_tables(vpc).await?;
        let cached = node.and_then(|n| node_annotation(n, NODE_ROUTE_TABLE_ID));
        if let Some(cached) = cached {
            if let Some(pos) = tables.iter().position(|t| t.id.as_str() == cached) {
                return Ok(tables.swap_remove(pos));
            }
            debug!(route_table_id = cached, "Cached route table is stale");
        }
        if tables.is_empty() {
            return Err(ReconcileError::NotFound(format!("route table of vpc {vpc}")));
        }
        Ok(tables.swap_remove(0))
    }

    /// List the pod routes of the cluster.
    ///
    /// A route whose owner left the cluster or opted out is flagged as
    /// blackhole rather than deleted. The full table is audited for
    /// conflicts in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the inventory or route tables cannot be listed.
    pub async fn list_managed_routes(&self, nodes: &[Node]) -> Result<Vec<ManagedRoute>> {
        let inventory = self.inventory().await?;
        let Some(vpc) = Self::vpc_of(nodes, &inventory) else {
            debug!("Cluster has no nodes, no routes to list");
            return Ok(Vec::new());
        };

        let rules: Vec<RouteRule> = self
            .vpc
            .list_route_tables(&vpc)
            .await?
            .into_iter()
            .flat_map(|t| t.rules)
            .collect();

        let recorder = Arc::clone(&self.recorder);
        let audited = rules.clone();
        tokio::spawn(async move {
            audit_routes(&audited, recorder.as_ref()).await;
        });

        let owners: Vec<(InstanceId, &Node)> = nodes
            .iter()
            .filter_map(|n| resolve_instance_id(n, &inventory).map(|id| (id, n)))
            .collect();

        let routes = rules
            .into_iter()
            .filter(is_pod_route)
            .map(|rule| {
                let owner = owners
                    .iter()
                    .find(|(id, _)| id.as_str() == rule.next_hop_id)
                    .map(|(_, node)| *node);
                ManagedRoute {
                    blackhole: owner.map_or(true, |n| !advertises_route(n)),
                    node_name: owner.and_then(|n| n.metadata.name.clone()),
                    rule_id: rule.route_rule_id,
                    destination: rule.destination,
                    next_hop: rule.next_hop_id,
                }
            })
            .collect();
        Ok(routes)
    }

    /// Route `destination` to `node`.
    ///
    /// Returns the rule id, or `None` when the node opted out.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::NotFound` if the node's instance or route
    /// table cannot be resolved, or the first failing remote call.
    pub async fn ensure_route(&self, node: &Node, destination: IpNet) -> Result<Option<RouteRuleId>> {
        let node_name = node.metadata.name.clone().unwrap_or_default();
        if !advertises_route(node) {
            debug!(node = %node_name, "Node does not advertise routes");
            return Ok(None);
        }

        let inventory = self.inventory().await?;
        let instance = resolve_instance_id(node, &inventory)
            .ok_or_else(|| ReconcileError::NotFound(format!("instance of node {node_name}")))?;
        let vpc = Self::vpc_of(std::slice::from_ref(node), &inventory)
            .ok_or_else(|| ReconcileError::NotFound(format!("vpc of node {node_name}")))?;
        let table = self.route_table(&vpc, Some(node)).await?;

        let mut current = None;
        for rule in table
            .rules
            .iter()
            .filter(|r| r.destination == destination && cidr::is_default_route(&r.source))
        {
            if rule.next_hop_id == instance.as_str() {
                current = Some(rule.route_rule_id.clone());
                continue;
            }
            info!(
                route_rule_id = %rule.route_rule_id,
                destination = %destination,
                stale_next_hop = %rule.next_hop_id,
                "Deleting stale route"
            );
            match self.vpc.delete_route_rule(&rule.route_rule_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        let rule_id = if let Some(id) = current {
            debug!(node = %node_name, destination = %destination, "Route already converged");
            id
        } else {
            info!(node = %node_name, destination = %destination, instance_id = %instance, "Creating route");
            self.vpc
                .create_route_rule(&CreateRouteRuleArgs {
                    route_table_id: table.id.clone(),
                    source: cidr::default_route_v4(),
                    destination,
                    next_hop_id: instance.to_string(),
                    next_hop_type: NextHopType::Custom,
                    description: ROUTE_DESCRIPTION_MARKER.to_string(),
                    client_token: ClientToken::generate(),
                })
                .await?
        };

        let patch: AnnotationPatch = [
            (NODE_VPC_ID.to_string(), Some(vpc.to_string())),
            (NODE_ROUTE_TABLE_ID.to_string(), Some(table.id.to_string())),
            (NODE_ROUTE_RULE_ID.to_string(), Some(rule_id.to_string())),
        ]
        .into_iter()
        .collect();
        let patch = effective_patch(node.metadata.annotations.as_ref(), patch);
        if !patch.is_empty() {
            self.store.patch_node_annotations(&node_name, &patch).await?;
        }

        Ok(Some(rule_id))
    }

    /// Delete every pod route for `destination`. Absent routes are converged.
    ///
    /// # Errors
    ///
    /// Returns the first failing remote call other than `NotFound`.
    pub async fn delete_route(&self, destination: &IpNet) -> Result<()> {
        let inventory = self.inventory().await?;
        let Some(vpc) = Self::vpc_of(&[], &inventory) else {
            debug!(destination = %destination, "Cluster has no nodes, no route to delete");
            return Ok(());
        };

        let tables = self.vpc.list_route_tables(&vpc).await?;
        let stale: Vec<&RouteRule> = tables
            .iter()
            .flat_map(|t| t.rules.iter())
            .filter(|r| is_pod_route(r) && &r.destination == destination)
            .collect();

        if stale.is_empty() {
            debug!(destination = %destination, "No route to delete");
            return Ok(());
        }

        for rule in stale {
            info!(route_rule_id = %rule.route_rule_id, destination = %destination, "Deleting route");
            match self.vpc.delete_route_rule(&rule.route_rule_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    warn!(route_rule_id = %rule.route_rule_id, "Route already deleted");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
