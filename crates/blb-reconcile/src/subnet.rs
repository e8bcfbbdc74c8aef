//! Subnet selection for new load balancers.
//!
//! Only general-purpose (`BCC`) subnets can host a load balancer. Selection
//! prefers reuse, in this order:
//!
//! 1. the subnet pinned on the Service,
//! 2. the subnet of a cluster node,
//! 3. an existing subnet with one of the reserved names,
//! 4. a new subnet in the first free block after the node subnet.

use blb_cloud::{ClusterApi, CreateSubnetArgs, SubnetType, VpcApi};
use blb_core::{cidr, ClientToken, SubnetId, VpcId};
use ipnet::Ipv4Net;
use tracing::{debug, info};

use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, Result};
use crate::retry::retry_fixed;

/// Description given to subnets created by the controller.
pub const CREATED_SUBNET_DESCRIPTION: &str = "auto generated by cce for load balancers";

/// Pick (or create) a subnet able to host a load balancer.
///
/// # Errors
///
/// Returns `ReconcileError::Validation` if the pinned subnet cannot host a
/// load balancer, `ReconcileError::NotFound` if the cluster has no nodes,
/// and `ReconcileError::Timeout` if creation keeps failing.
pub async fn allocate_subnet_for_lb(
    vpc: &dyn VpcApi,
    cluster: &dyn ClusterApi,
    config: &ReconcilerConfig,
    pinned: Option<&SubnetId>,
) -> Result<(VpcId, SubnetId)> {
    if let Some(id) = pinned {
        let subnet = vpc.describe_subnet(id).await?;
        if subnet.subnet_type != SubnetType::Bcc {
            return Err(ReconcileError::Validation(format!(
                "subnet {id} has type {:?} and cannot host a load balancer",
                subnet.subnet_type
            )));
        }
        debug!(subnet_id = %id, "Using pinned subnet");
        return Ok((subnet.vpc_id, subnet.id));
    }

    let nodes = cluster.list_nodes(&config.cluster_id).await?;
    let node = nodes.first().ok_or_else(|| {
        ReconcileError::NotFound(format!("cluster {} has no nodes", config.cluster_id))
    })?;

    let node_subnet = vpc.describe_subnet(&node.subnet_id).await?;
    if node_subnet.subnet_type == SubnetType::Bcc {
        debug!(subnet_id = %node_subnet.id, "Reusing node subnet");
        return Ok((node_subnet.vpc_id, node_subnet.id));
    }

    let vpc_id = node_subnet.vpc_id.clone();
    let subnets = vpc.list_subnets(&vpc_id).await?;
    if let Some(reserved) = subnets.iter().find(|s| {
        s.subnet_type == SubnetType::Bcc && config.reserved_subnet_names.contains(&s.name)
    }) {
        debug!(subnet_id = %reserved.id, name = %reserved.name, "Reusing reserved subnet");
        return Ok((vpc_id, reserved.id.clone()));
    }

    let taken: Vec<Ipv4Net> = subnets.iter().map(|s| s.cidr).collect();
    let block = cidr::next_free_block(&node_subnet.cidr, &taken, None)?;

    let args = CreateSubnetArgs {
        name: config.created_subnet_name().to_string(),
        zone: node_subnet.zone.clone(),
        cidr: block,
        vpc_id: vpc_id.clone(),
        subnet_type: SubnetType::Bcc,
        description: CREATED_SUBNET_DESCRIPTION.to_string(),
        client_token: ClientToken::generate(),
    };

    info!(vpc_id = %vpc_id, cidr = %block, zone = %args.zone, "Creating load balancer subnet");
    let id = retry_fixed(config.subnet_create, "subnet creation", || {
        let args = &args;
        async move { vpc.create_subnet(args).await.map_err(ReconcileError::from) }
    })
    .await?;

    Ok((vpc_id, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use blb_cloud::{CloudError, ClusterNode, InstanceStatus, MockCloud, Subnet};
    use blb_core::{ClusterId, InstanceId};

    fn subnet(id: &str, name: &str, cidr: &str, kind: SubnetType) -> Subnet {
        Subnet {
            id: SubnetId::new(id).unwrap(),
            name: name.into(),
            cidr: cidr.parse().unwrap(),
            vpc_id: VpcId::new("vpc-1").unwrap(),
            zone: "zoneA".into(),
            subnet_type: kind,
        }
    }

    fn setup(node_subnet_type: SubnetType) -> (MockCloud, ReconcilerConfig) {
        let cloud = MockCloud::new();
        cloud.insert_subnet(subnet("sbn-node", "nodes", "192.168.0.0/24", node_subnet_type));
        cloud.insert_node(ClusterNode {
            instance_id: InstanceId::new("i-1").unwrap(),
            internal_ip: "192.168.0.10".parse().unwrap(),
            hostname: "n1".into(),
            vpc_id: VpcId::new("vpc-1").unwrap(),
            subnet_id: SubnetId::new("sbn-node").unwrap(),
            zone: "zoneA".into(),
            status: InstanceStatus::Running,
        });
        (cloud, ReconcilerConfig::new(ClusterId::new("c-1").unwrap()))
    }

    #[tokio::test]
    async fn pinned_subnet_must_be_bcc() {
        let (cloud, config) = setup(SubnetType::Bcc);
        cloud.insert_subnet(subnet("sbn-nat", "nat", "192.168.9.0/24", SubnetType::BccNat));

        let (vpc, id) = allocate_subnet_for_lb(&cloud, &cloud, &config, Some(&SubnetId::new("sbn-node").unwrap()))
            .await
            .unwrap();
        assert_eq!((vpc.as_str(), id.as_str()), ("vpc-1", "sbn-node"));

        let err = allocate_subnet_for_lb(&cloud, &cloud, &config, Some(&SubnetId::new("sbn-nat").unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Validation(_)));
    }

    #[tokio::test]
    async fn reuses_compatible_node_subnet() {
        let (cloud, config) = setup(SubnetType::Bcc);
        let (_, id) = allocate_subnet_for_lb(&cloud, &cloud, &config, None).await.unwrap();
        assert_eq!(id.as_str(), "sbn-node");
        assert_eq!(cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn reuses_reserved_subnet() {
        let (cloud, config) = setup(SubnetType::BccNat);
        cloud.insert_subnet(subnet("sbn-rsv", "系统预留BLB子网", "192.168.5.0/24", SubnetType::Bcc));

        let (_, id) = allocate_subnet_for_lb(&cloud, &cloud, &config, None).await.unwrap();
        assert_eq!(id.as_str(), "sbn-rsv");
        assert_eq!(cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn creates_next_free_block() {
        let (cloud, config) = setup(SubnetType::BccNat);
        cloud.insert_subnet(subnet("sbn-2", "other", "192.168.1.0/24", SubnetType::Bcc));

        let (_, id) = allocate_subnet_for_lb(&cloud, &cloud, &config, None).await.unwrap();

        let created = cloud.subnets().into_iter().find(|s| s.id == id).unwrap();
        assert_eq!(created.cidr, "192.168.2.0/24".parse::<Ipv4Net>().unwrap());
        assert_eq!(created.name, "CCE-Reserve");
        assert_eq!(created.subnet_type, SubnetType::Bcc);
        assert_eq!(created.zone, "zoneA");
    }

    #[tokio::test(start_paused = true)]
    async fn creation_retries_transient_failures() {
        let (cloud, config) = setup(SubnetType::BccNat);
        for _ in 0..3 {
            cloud.fail_next(
                "create_subnet",
                CloudError::Transient {
                    status: 503,
                    message: "busy".into(),
                },
            );
        }

        allocate_subnet_for_lb(&cloud, &cloud, &config, None).await.unwrap();
        assert_eq!(cloud.count("create_subnet"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_gives_up() {
        let (cloud, config) = setup(SubnetType::BccNat);
        for _ in 0..10 {
            cloud.fail_next(
                "create_subnet",
                CloudError::Transient {
                    status: 503,
                    message: "busy".into(),
                },
            );
        }

        let err = allocate_subnet_for_lb(&cloud, &cloud, &config, None).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Timeout { attempts: 10, .. }));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn empty_cluster() {
        let cloud = MockCloud::new();
        let config = ReconcilerConfig::new(ClusterId::new("c-1").unwrap());
        let err = allocate_subnet_for_lb(&cloud, &cloud, &config, None).await.unwrap_err();
        assert!(matches!(err, ReconcileError::NotFound(_)));
    }
}
