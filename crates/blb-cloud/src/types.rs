//! Typed records exchanged with the cloud vendor APIs.
//!
//! Field names follow the vendor's camelCase JSON so the records double as
//! wire types.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use blb_core::{
    ClientToken, InstanceId, LoadBalancerId, RouteRuleId, RouteTableId, SubnetId, VpcId,
};
use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

// ============================================================================
// Load balancer
// ============================================================================

/// Lifecycle status of a load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancerStatus {
    /// Being provisioned.
    Creating,
    /// Ready to accept configuration.
    Available,
    /// A configuration change is being applied.
    Updating,
    /// Suspended for billing reasons.
    Paused,
    /// Not serving traffic.
    Unavailable,
    /// Any status this client does not know.
    #[default]
    #[serde(other)]
    Unknown,
}

/// A load balancer as reported by the vendor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    /// Vendor identifier.
    #[serde(rename = "blbId")]
    pub id: LoadBalancerId,
    /// Display name.
    pub name: String,
    /// Lifecycle status.
    #[serde(default)]
    pub status: LoadBalancerStatus,
    /// Internal (VPC) address.
    #[serde(default)]
    pub address: Option<IpAddr>,
    /// Bound elastic IP, if any.
    #[serde(default, rename = "publicIp")]
    pub public_address: Option<IpAddr>,
    /// Free-form description.
    #[serde(default, rename = "desc")]
    pub description: String,
    /// VPC hosting the load balancer.
    #[serde(default)]
    pub vpc_id: Option<VpcId>,
    /// Subnet hosting the load balancer.
    #[serde(default)]
    pub subnet_id: Option<SubnetId>,
}

/// Arguments for creating a load balancer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLoadBalancerArgs {
    /// Display name; also the lookup key for find-or-create.
    pub name: String,
    /// Target VPC.
    pub vpc_id: VpcId,
    /// Target subnet.
    pub subnet_id: SubnetId,
    /// Free-form description.
    #[serde(rename = "desc")]
    pub description: String,
    /// Idempotency token.
    #[serde(skip)]
    pub client_token: ClientToken,
}

/// Mutable attributes of a load balancer. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLoadBalancerArgs {
    /// New display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New description.
    #[serde(rename = "desc", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ============================================================================
// Listeners and backends
// ============================================================================

/// Listener protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// Layer-4 TCP.
    Tcp,
    /// Layer-4 UDP.
    Udp,
    /// Layer-7 HTTP.
    Http,
    /// Layer-7 HTTPS.
    Https,
}

impl Protocol {
    /// All protocol kinds.
    pub const ALL: [Self; 4] = [Self::Tcp, Self::Udp, Self::Http, Self::Https];

    /// The vendor's name for the protocol.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Http => "HTTP",
            Self::Https => "HTTPS",
        }
    }

    /// Whether listeners of this kind can be created, updated and described.
    #[must_use]
    pub const fn is_supported(&self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            "HTTP" => Ok(Self::Http),
            "HTTPS" => Ok(Self::Https),
            other => Err(format!("unknown protocol {other:?}")),
        }
    }
}

/// A listener forwarding a front-end port to a backend port.
///
/// One listener exists per port regardless of protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    /// Front-end port.
    #[serde(rename = "listenerPort")]
    pub port: u16,
    /// Listener protocol.
    pub protocol: Protocol,
    /// Port on the backend instances (the Service's node port).
    pub backend_port: u16,
}

/// A backend instance registered on a load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    /// Backend instance.
    pub instance_id: InstanceId,
    /// Traffic weight.
    pub weight: u32,
}

// ============================================================================
// Elastic IP
// ============================================================================

/// Lifecycle status of an elastic IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EipStatus {
    /// Being allocated.
    Creating,
    /// Allocated and unbound.
    Available,
    /// Bound to an instance.
    #[serde(rename = "binded")]
    Bound,
    /// Bind in progress.
    Binding,
    /// Unbind in progress.
    Unbinding,
    /// Bandwidth change in progress.
    Updating,
    /// Suspended for billing reasons.
    Paused,
    /// Not usable.
    Unavailable,
    /// Any status this client does not know.
    #[default]
    #[serde(other)]
    Unknown,
}

/// When an elastic IP is paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PaymentTiming {
    /// Reserved up front for a number of months.
    Prepaid,
    /// Billed as used.
    #[default]
    Postpaid,
}

/// How a postpaid elastic IP is metered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BillingMethod {
    /// Metered by transferred bytes.
    #[default]
    ByTraffic,
    /// Metered by provisioned bandwidth.
    ByBandwidth,
}

impl FromStr for PaymentTiming {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Prepaid" => Ok(Self::Prepaid),
            "Postpaid" => Ok(Self::Postpaid),
            other => Err(format!("unknown payment timing {other:?}")),
        }
    }
}

impl FromStr for BillingMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ByTraffic" => Ok(Self::ByTraffic),
            "ByBandwidth" => Ok(Self::ByBandwidth),
            other => Err(format!("unknown billing method {other:?}")),
        }
    }
}

/// Reservation period of a prepaid elastic IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    /// Number of months reserved.
    pub reservation_length: u32,
}

/// Billing parameters of an elastic IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Billing {
    /// When the address is paid for.
    pub payment_timing: PaymentTiming,
    /// Metering method; absent for prepaid addresses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_method: Option<BillingMethod>,
    /// Reservation period; only for prepaid addresses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation: Option<Reservation>,
}

/// An elastic IP as reported by the vendor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip {
    /// The public address.
    #[serde(rename = "eip")]
    pub address: IpAddr,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Lifecycle status.
    #[serde(default)]
    pub status: EipStatus,
    /// When the address is paid for.
    #[serde(default)]
    pub payment_timing: PaymentTiming,
    /// Metering method; absent for prepaid addresses.
    #[serde(default)]
    pub billing_method: Option<BillingMethod>,
    /// Provisioned bandwidth.
    #[serde(rename = "bandwidthInMbps")]
    pub bandwidth_mbps: u32,
    /// Instance the address is bound to.
    #[serde(default)]
    pub instance_id: Option<String>,
}

/// Arguments for allocating an elastic IP.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEipArgs {
    /// Display name; also the lookup key for find-or-create.
    pub name: String,
    /// Provisioned bandwidth.
    #[serde(rename = "bandwidthInMbps")]
    pub bandwidth_mbps: u32,
    /// Billing parameters.
    pub billing: Billing,
    /// Idempotency token.
    #[serde(skip)]
    pub client_token: ClientToken,
}

// ============================================================================
// VPC
// ============================================================================

/// Kind of a VPC subnet. Only [`SubnetType::Bcc`] subnets can host a load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SubnetType {
    /// General purpose compute subnet.
    #[serde(rename = "BCC")]
    Bcc,
    /// Compute subnet reachable only through NAT.
    #[serde(rename = "BCC_NAT")]
    BccNat,
    /// Bare-metal subnet.
    #[serde(rename = "BBC")]
    Bbc,
    /// Any type this client does not know.
    #[default]
    #[serde(other)]
    Unknown,
}

/// A VPC subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    /// Vendor identifier.
    #[serde(rename = "subnetId")]
    pub id: SubnetId,
    /// Display name.
    pub name: String,
    /// Address block.
    pub cidr: Ipv4Net,
    /// Owning VPC.
    pub vpc_id: VpcId,
    /// Availability zone.
    #[serde(rename = "zoneName")]
    pub zone: String,
    /// Subnet kind.
    #[serde(default)]
    pub subnet_type: SubnetType,
}

/// Arguments for creating a subnet.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubnetArgs {
    /// Display name.
    pub name: String,
    /// Availability zone.
    #[serde(rename = "zoneName")]
    pub zone: String,
    /// Address block.
    pub cidr: Ipv4Net,
    /// Owning VPC.
    pub vpc_id: VpcId,
    /// Subnet kind.
    pub subnet_type: SubnetType,
    /// Free-form description.
    pub description: String,
    /// Idempotency token.
    #[serde(skip)]
    pub client_token: ClientToken,
}

/// Kind of next hop of a route rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum NextHopType {
    /// A compute instance; pod-CIDR routes use this.
    Custom,
    /// A VPN gateway.
    Vpn,
    /// A NAT gateway.
    Nat,
    /// A peering connection.
    PeerConn,
    /// A dedicated-line gateway.
    DcGateway,
    /// Any type this client does not know.
    #[default]
    #[serde(other)]
    Unknown,
}

/// A route-table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    /// Vendor identifier of the entry.
    pub route_rule_id: RouteRuleId,
    /// Owning route table.
    pub route_table_id: RouteTableId,
    /// Source block.
    #[serde(rename = "sourceAddress")]
    pub source: IpNet,
    /// Destination block.
    #[serde(rename = "destinationAddress")]
    pub destination: IpNet,
    /// Next hop identifier (an instance ID for custom routes).
    #[serde(rename = "nexthopId")]
    pub next_hop_id: String,
    /// Next hop kind.
    #[serde(rename = "nexthopType")]
    pub next_hop_type: NextHopType,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

/// A VPC route table with its entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTable {
    /// Vendor identifier.
    #[serde(rename = "routeTableId")]
    pub id: RouteTableId,
    /// Owning VPC.
    pub vpc_id: VpcId,
    /// Entries.
    #[serde(default, rename = "routeRules")]
    pub rules: Vec<RouteRule>,
}

/// Arguments for creating a route-table entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRouteRuleArgs {
    /// Target route table.
    pub route_table_id: RouteTableId,
    /// Source block.
    #[serde(rename = "sourceAddress")]
    pub source: IpNet,
    /// Destination block.
    #[serde(rename = "destinationAddress")]
    pub destination: IpNet,
    /// Next hop identifier.
    #[serde(rename = "nexthopId")]
    pub next_hop_id: String,
    /// Next hop kind.
    #[serde(rename = "nexthopType")]
    pub next_hop_type: NextHopType,
    /// Free-form description.
    pub description: String,
    /// Idempotency token.
    #[serde(skip)]
    pub client_token: ClientToken,
}

// ============================================================================
// Cluster inventory
// ============================================================================

/// Status of a cluster instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Being provisioned.
    Creating,
    /// Serving.
    Running,
    /// Stopped.
    Stopped,
    /// Being removed.
    Deleting,
    /// Failed.
    Error,
    /// Any status this client does not know.
    #[default]
    #[serde(other)]
    Unknown,
}

/// A compute instance belonging to a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    /// Instance identifier.
    pub instance_id: InstanceId,
    /// VPC address of the instance.
    pub internal_ip: IpAddr,
    /// Hostname.
    #[serde(default)]
    pub hostname: String,
    /// VPC of the instance.
    pub vpc_id: VpcId,
    /// Subnet of the instance.
    pub subnet_id: SubnetId,
    /// Availability zone.
    #[serde(rename = "zoneName")]
    pub zone: String,
    /// Instance status.
    #[serde(default)]
    pub status: InstanceStatus,
}

impl ClusterNode {
    /// Whether the instance answers to a Kubernetes node name.
    ///
    /// Node names are either the hostname or the internal IP.
    #[must_use]
    pub fn matches_node_name(&self, node_name: &str) -> bool {
        self.hostname == node_name || self.internal_ip.to_string() == node_name
    }
}
