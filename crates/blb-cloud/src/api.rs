//! Collaborator interfaces consumed by the reconciliation engine.
//!
//! Each trait is a thin, typed view of one vendor API. Implementations must
//! report absent resources as [`CloudError::NotFound`](crate::CloudError::NotFound)
//! so callers can treat them as already converged.

use std::net::IpAddr;

use async_trait::async_trait;
use blb_core::{ClusterId, InstanceId, LoadBalancerId, RouteRuleId, SubnetId, VpcId};

use crate::error::Result;
use crate::types::{
    Backend, ClusterNode, CreateEipArgs, CreateLoadBalancerArgs, CreateRouteRuleArgs,
    CreateSubnetArgs, Eip, Listener, LoadBalancer, Protocol, RouteTable, Subnet,
    UpdateLoadBalancerArgs,
};

/// The load balancer API.
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    /// Describe one load balancer.
    ///
    /// # Errors
    ///
    /// Returns `CloudError::NotFound` if it does not exist.
    async fn describe_load_balancer(&self, id: &LoadBalancerId) -> Result<LoadBalancer>;

    /// Describe all load balancers with exactly this name.
    async fn describe_load_balancers_by_name(&self, name: &str) -> Result<Vec<LoadBalancer>>;

    /// Create a load balancer.
    async fn create_load_balancer(&self, args: &CreateLoadBalancerArgs) -> Result<LoadBalancer>;

    /// Update a load balancer's name and/or description.
    async fn update_load_balancer(
        &self,
        id: &LoadBalancerId,
        args: &UpdateLoadBalancerArgs,
    ) -> Result<()>;

    /// Delete a load balancer.
    async fn delete_load_balancer(&self, id: &LoadBalancerId) -> Result<()>;

    /// Describe the listeners of one protocol.
    ///
    /// # Errors
    ///
    /// Returns `CloudError::Unsupported` for protocols without listener support.
    async fn describe_listeners(
        &self,
        id: &LoadBalancerId,
        protocol: Protocol,
    ) -> Result<Vec<Listener>>;

    /// Create a listener.
    async fn create_listener(&self, id: &LoadBalancerId, listener: &Listener) -> Result<()>;

    /// Update the listener on `listener.port`.
    async fn update_listener(&self, id: &LoadBalancerId, listener: &Listener) -> Result<()>;

    /// Delete the listeners on the given ports in one call.
    async fn delete_listeners(&self, id: &LoadBalancerId, ports: &[u16]) -> Result<()>;

    /// Describe all registered backends.
    async fn describe_backends(&self, id: &LoadBalancerId) -> Result<Vec<Backend>>;

    /// Register backends in one call.
    async fn add_backends(&self, id: &LoadBalancerId, backends: &[Backend]) -> Result<()>;

    /// Deregister backends in one call.
    async fn remove_backends(&self, id: &LoadBalancerId, instances: &[InstanceId]) -> Result<()>;
}

/// The elastic IP API.
#[async_trait]
pub trait EipApi: Send + Sync {
    /// Allocate an address and return it.
    async fn create_eip(&self, args: &CreateEipArgs) -> Result<IpAddr>;

    /// Bind an address to a load balancer.
    async fn bind_eip(&self, address: IpAddr, load_balancer: &LoadBalancerId) -> Result<()>;

    /// Unbind an address from whatever it is bound to.
    async fn unbind_eip(&self, address: IpAddr) -> Result<()>;

    /// Change the bandwidth of an address.
    async fn resize_eip(&self, address: IpAddr, bandwidth_mbps: u32) -> Result<()>;

    /// Release an address.
    async fn delete_eip(&self, address: IpAddr) -> Result<()>;

    /// Look up one address.
    ///
    /// # Errors
    ///
    /// Returns `CloudError::NotFound` if it does not exist.
    async fn get_eip(&self, address: IpAddr) -> Result<Eip>;

    /// Look up all addresses with exactly this name.
    async fn find_eips_by_name(&self, name: &str) -> Result<Vec<Eip>>;
}

/// The VPC API.
#[async_trait]
pub trait VpcApi: Send + Sync {
    /// Describe one subnet.
    async fn describe_subnet(&self, id: &SubnetId) -> Result<Subnet>;

    /// List the subnets of a VPC.
    async fn list_subnets(&self, vpc: &VpcId) -> Result<Vec<Subnet>>;

    /// Create a subnet and return its identifier.
    async fn create_subnet(&self, args: &CreateSubnetArgs) -> Result<SubnetId>;

    /// List the route tables of a VPC, including their entries.
    async fn list_route_tables(&self, vpc: &VpcId) -> Result<Vec<RouteTable>>;

    /// Create a route-table entry and return its identifier.
    async fn create_route_rule(&self, args: &CreateRouteRuleArgs) -> Result<RouteRuleId>;

    /// Delete a route-table entry.
    async fn delete_route_rule(&self, id: &RouteRuleId) -> Result<()>;
}

/// The cluster inventory API.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List the compute instances of a cluster.
    async fn list_nodes(&self, cluster: &ClusterId) -> Result<Vec<ClusterNode>>;
}
