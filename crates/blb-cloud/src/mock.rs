//! In-memory cloud for tests.
//!
//! [`MockCloud`] implements every collaborator trait against shared state and
//! records each mutating call, so tests can assert exactly which remote
//! mutations a reconciliation issued.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use blb_core::{ClusterId, InstanceId, LoadBalancerId, RouteRuleId, SubnetId, VpcId};
use parking_lot::Mutex;

use crate::api::{ClusterApi, EipApi, LoadBalancerApi, VpcApi};
use crate::error::{CloudError, Result};
use crate::types::{
    Backend, ClusterNode, CreateEipArgs, CreateLoadBalancerArgs, CreateRouteRuleArgs,
    CreateSubnetArgs, Eip, EipStatus, Listener, LoadBalancer, LoadBalancerStatus, Protocol,
    RouteRule, RouteTable, Subnet, UpdateLoadBalancerArgs,
};

/// A recorded mutating call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// Trait method name, e.g. `bind_eip`.
    pub op: &'static str,
    /// Human-readable arguments.
    pub detail: String,
}

#[derive(Default)]
struct MockLoadBalancer {
    record: Option<LoadBalancer>,
    listeners: BTreeMap<u16, Listener>,
    backends: BTreeMap<InstanceId, Backend>,
}

#[derive(Default)]
struct State {
    load_balancers: BTreeMap<LoadBalancerId, MockLoadBalancer>,
    lb_status_script: VecDeque<LoadBalancerStatus>,
    eips: BTreeMap<IpAddr, Eip>,
    eip_status_scripts: HashMap<IpAddr, VecDeque<EipStatus>>,
    subnets: Vec<Subnet>,
    route_tables: Vec<RouteTable>,
    nodes: Vec<ClusterNode>,
    failures: HashMap<&'static str, VecDeque<CloudError>>,
    calls: Vec<MockCall>,
    next_id: u32,
}

impl State {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn take_failure(&mut self, op: &'static str) -> Result<()> {
        match self.failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record(&mut self, op: &'static str, detail: String) {
        self.calls.push(MockCall { op, detail });
    }

    fn lb_mut(&mut self, id: &LoadBalancerId) -> Result<&mut MockLoadBalancer> {
        self.load_balancers
            .get_mut(id)
            .filter(|lb| lb.record.is_some())
            .ok_or_else(|| CloudError::NotFound(format!("load balancer {id}")))
    }

    fn record_mut(&mut self, id: &LoadBalancerId) -> Result<&mut LoadBalancer> {
        self.lb_mut(id)?
            .record
            .as_mut()
            .ok_or_else(|| CloudError::NotFound(format!("load balancer {id}")))
    }

    fn eip_mut(&mut self, address: IpAddr) -> Result<&mut Eip> {
        self.eips
            .get_mut(&address)
            .ok_or_else(|| CloudError::NotFound(format!("eip {address}")))
    }
}

fn ensure_supported(protocol: Protocol) -> Result<()> {
    if protocol.is_supported() {
        Ok(())
    } else {
        Err(CloudError::Unsupported(format!("{protocol} listeners")))
    }
}

/// An in-memory implementation of every cloud API.
#[derive(Default)]
pub struct MockCloud {
    state: Mutex<State>,
}

impl MockCloud {
    /// Create an empty mock cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ---- seeding ----------------------------------------------------------

    /// Insert a load balancer as if it already existed.
    pub fn insert_load_balancer(&self, lb: LoadBalancer) {
        let id = lb.id.clone();
        let mut state = self.state.lock();
        state.load_balancers.entry(id).or_default().record = Some(lb);
    }

    /// Insert a listener on an existing load balancer.
    pub fn insert_listener(&self, id: &LoadBalancerId, listener: Listener) {
        let mut state = self.state.lock();
        state
            .load_balancers
            .entry(id.clone())
            .or_default()
            .listeners
            .insert(listener.port, listener);
    }

    /// Register a backend on an existing load balancer.
    pub fn insert_backend(&self, id: &LoadBalancerId, backend: Backend) {
        let mut state = self.state.lock();
        state
            .load_balancers
            .entry(id.clone())
            .or_default()
            .backends
            .insert(backend.instance_id.clone(), backend);
    }

    /// Insert an elastic IP.
    pub fn insert_eip(&self, eip: Eip) {
        self.state.lock().eips.insert(eip.address, eip);
    }

    /// Insert a subnet.
    pub fn insert_subnet(&self, subnet: Subnet) {
        self.state.lock().subnets.push(subnet);
    }

    /// Insert a route table.
    pub fn insert_route_table(&self, table: RouteTable) {
        self.state.lock().route_tables.push(table);
    }

    /// Insert a cluster instance.
    pub fn insert_node(&self, node: ClusterNode) {
        self.state.lock().nodes.push(node);
    }

    // ---- scripting --------------------------------------------------------

    /// Make the next call to `op` fail with `err`. Repeated calls queue up.
    pub fn fail_next(&self, op: &'static str, err: CloudError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Statuses reported by successive `get_eip` calls for `address`.
    ///
    /// Once the script runs out the last status sticks.
    pub fn script_eip_status(&self, address: IpAddr, statuses: impl IntoIterator<Item = EipStatus>) {
        self.state
            .lock()
            .eip_status_scripts
            .insert(address, statuses.into_iter().collect());
    }

    /// Statuses reported by successive `describe_load_balancer` calls.
    ///
    /// Load balancers created while a script is pending start as `creating`.
    pub fn script_load_balancer_status(
        &self,
        statuses: impl IntoIterator<Item = LoadBalancerStatus>,
    ) {
        self.state.lock().lb_status_script = statuses.into_iter().collect();
    }

    // ---- inspection -------------------------------------------------------

    /// All recorded mutating calls, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded calls to `op`.
    #[must_use]
    pub fn count(&self, op: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| c.op == op).count()
    }

    /// Total number of recorded mutating calls.
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Forget all recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Current record of a load balancer.
    #[must_use]
    pub fn load_balancer(&self, id: &LoadBalancerId) -> Option<LoadBalancer> {
        self.state
            .lock()
            .load_balancers
            .get(id)
            .and_then(|lb| lb.record.clone())
    }

    /// All existing load balancers.
    #[must_use]
    pub fn load_balancers(&self) -> Vec<LoadBalancer> {
        self.state
            .lock()
            .load_balancers
            .values()
            .filter_map(|lb| lb.record.clone())
            .collect()
    }

    /// Listeners of a load balancer, ordered by port.
    #[must_use]
    pub fn listeners(&self, id: &LoadBalancerId) -> Vec<Listener> {
        self.state
            .lock()
            .load_balancers
            .get(id)
            .map(|lb| lb.listeners.values().copied().collect())
            .unwrap_or_default()
    }

    /// Backends of a load balancer, ordered by instance id.
    #[must_use]
    pub fn backends(&self, id: &LoadBalancerId) -> Vec<Backend> {
        self.state
            .lock()
            .load_balancers
            .get(id)
            .map(|lb| lb.backends.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Current record of an elastic IP.
    #[must_use]
    pub fn eip(&self, address: IpAddr) -> Option<Eip> {
        self.state.lock().eips.get(&address).cloned()
    }

    /// All existing elastic IPs.
    #[must_use]
    pub fn eips(&self) -> Vec<Eip> {
        self.state.lock().eips.values().cloned().collect()
    }

    /// All subnets.
    #[must_use]
    pub fn subnets(&self) -> Vec<Subnet> {
        self.state.lock().subnets.clone()
    }

    /// All route rules across every table.
    #[must_use]
    pub fn route_rules(&self) -> Vec<RouteRule> {
        self.state
            .lock()
            .route_tables
            .iter()
            .flat_map(|t| t.rules.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl LoadBalancerApi for MockCloud {
    async fn describe_load_balancer(&self, id: &LoadBalancerId) -> Result<LoadBalancer> {
        let mut state = self.state.lock();
        state.take_failure("describe_load_balancer")?;
        let scripted = state.lb_status_script.pop_front();
        let record = state.record_mut(id)?;
        if let Some(status) = scripted {
            record.status = status;
        }
        Ok(record.clone())
    }

    async fn describe_load_balancers_by_name(&self, name: &str) -> Result<Vec<LoadBalancer>> {
        let mut state = self.state.lock();
        state.take_failure("describe_load_balancers_by_name")?;
        Ok(state
            .load_balancers
            .values()
            .filter_map(|lb| lb.record.clone())
            .filter(|lb| lb.name == name)
            .collect())
    }

    async fn create_load_balancer(&self, args: &CreateLoadBalancerArgs) -> Result<LoadBalancer> {
        let mut state = self.state.lock();
        state.take_failure("create_load_balancer")?;
        state.record("create_load_balancer", args.name.clone());

        let n = state.next_id();
        let id = LoadBalancerId::new(format!("lb-{n:04}"))
            .map_err(|e| CloudError::Decode(e.to_string()))?;
        let octet = u8::try_from(n % 250).unwrap_or(0) + 1;
        let status = if state.lb_status_script.is_empty() {
            LoadBalancerStatus::Available
        } else {
            LoadBalancerStatus::Creating
        };

        let record = LoadBalancer {
            id: id.clone(),
            name: args.name.clone(),
            status,
            address: Some(IpAddr::V4(Ipv4Addr::new(192, 168, 100, octet))),
            public_address: None,
            description: args.description.clone(),
            vpc_id: Some(args.vpc_id.clone()),
            subnet_id: Some(args.subnet_id.clone()),
        };
        state.load_balancers.insert(
            id,
            MockLoadBalancer {
                record: Some(record.clone()),
                ..MockLoadBalancer::default()
            },
        );
        Ok(record)
    }

    async fn update_load_balancer(
        &self,
        id: &LoadBalancerId,
        args: &UpdateLoadBalancerArgs,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.take_failure("update_load_balancer")?;
        state.record("update_load_balancer", format!("{id} {args:?}"));

        let record = state.record_mut(id)?;
        if let Some(name) = &args.name {
            record.name.clone_from(name);
        }
        if let Some(description) = &args.description {
            record.description.clone_from(description);
        }
        Ok(())
    }

    async fn delete_load_balancer(&self, id: &LoadBalancerId) -> Result<()> {
        let mut state = self.state.lock();
        state.take_failure("delete_load_balancer")?;
        state.record("delete_load_balancer", id.to_string());

        let public = state.record_mut(id)?.public_address;
        state.load_balancers.remove(id);
        if let Some(address) = public {
            if let Some(eip) = state.eips.get_mut(&address) {
                eip.status = EipStatus::Available;
                eip.instance_id = None;
            }
        }
        Ok(())
    }

    async fn describe_listeners(
        &self,
        id: &LoadBalancerId,
        protocol: Protocol,
    ) -> Result<Vec<Listener>> {
        ensure_supported(protocol)?;
        let mut state = self.state.lock();
        state.take_failure("describe_listeners")?;
        Ok(state
            .lb_mut(id)?
            .listeners
            .values()
            .filter(|l| l.protocol == protocol)
            .copied()
            .collect())
    }

    async fn create_listener(&self, id: &LoadBalancerId, listener: &Listener) -> Result<()> {
        ensure_supported(listener.protocol)?;
        let mut state = self.state.lock();
        state.take_failure("create_listener")?;
        state.record("create_listener", format!("{id} {listener:?}"));

        let lb = state.lb_mut(id)?;
        if lb.listeners.contains_key(&listener.port) {
            return Err(CloudError::Conflict(format!(
                "port {} already has a listener",
                listener.port
            )));
        }
        lb.listeners.insert(listener.port, *listener);
        Ok(())
    }

    async fn update_listener(&self, id: &LoadBalancerId, listener: &Listener) -> Result<()> {
        ensure_supported(listener.protocol)?;
        let mut state = self.state.lock();
        state.take_failure("update_listener")?;
        state.record("update_listener", format!("{id} {listener:?}"));

        let lb = state.lb_mut(id)?;
        match lb.listeners.get_mut(&listener.port) {
            Some(existing) => {
                *existing = *listener;
                Ok(())
            }
            None => Err(CloudError::NotFound(format!(
                "listener on port {}",
                listener.port
            ))),
        }
    }

    async fn delete_listeners(&self, id: &LoadBalancerId, ports: &[u16]) -> Result<()> {
        let mut state = self.state.lock();
        state.take_failure("delete_listeners")?;
        state.record("delete_listeners", format!("{id} {ports:?}"));

        let lb = state.lb_mut(id)?;
        for port in ports {
            lb.listeners.remove(port);
        }
        Ok(())
    }

    async fn describe_backends(&self, id: &LoadBalancerId) -> Result<Vec<Backend>> {
        let mut state = self.state.lock();
        state.take_failure("describe_backends")?;
        Ok(state.lb_mut(id)?.backends.values().cloned().collect())
    }

    async fn add_backends(&self, id: &LoadBalancerId, backends: &[Backend]) -> Result<()> {
        let mut state = self.state.lock();
        state.take_failure("add_backends")?;
        let ids: Vec<&str> = backends.iter().map(|b| b.instance_id.as_str()).collect();
        state.record("add_backends", format!("{id} {ids:?}"));

        let lb = state.lb_mut(id)?;
        for backend in backends {
            lb.backends
                .insert(backend.instance_id.clone(), backend.clone());
        }
        Ok(())
    }

    async fn remove_backends(&self, id: &LoadBalancerId, instances: &[InstanceId]) -> Result<()> {
        let mut state = self.state.lock();
        state.take_failure("remove_backends")?;
        state.record("remove_backends", format!("{id} {instances:?}"));

        let lb = state.lb_mut(id)?;
        for instance in instances {
            lb.backends.remove(instance);
        }
        Ok(())
    }
}

#[async_trait]
impl EipApi for MockCloud {
    async fn create_eip(&self, args: &CreateEipArgs) -> Result<IpAddr> {
        let mut state = self.state.lock();
        state.take_failure("create_eip")?;
        state.record("create_eip", args.name.clone());

        let n = state.next_id();
        let octet = u8::try_from(n % 250).unwrap_or(0) + 1;
        let address = IpAddr::V4(Ipv4Addr::new(180, 76, 0, octet));
        state.eips.insert(
            address,
            Eip {
                address,
                name: args.name.clone(),
                status: EipStatus::Available,
                payment_timing: args.billing.payment_timing,
                billing_method: args.billing.billing_method,
                bandwidth_mbps: args.bandwidth_mbps,
                instance_id: None,
            },
        );
        Ok(address)
    }

    async fn bind_eip(&self, address: IpAddr, load_balancer: &LoadBalancerId) -> Result<()> {
        let mut state = self.state.lock();
        state.take_failure("bind_eip")?;
        state.record("bind_eip", format!("{address} -> {load_balancer}"));

        if state.eip_mut(address)?.status != EipStatus::Available {
            return Err(CloudError::Conflict(format!("eip {address} is not available")));
        }
        let record = state.record_mut(load_balancer)?;
        if let Some(bound) = record.public_address {
            return Err(CloudError::Conflict(format!(
                "load balancer {load_balancer} already bound to {bound}"
            )));
        }
        record.public_address = Some(address);

        let eip = state.eip_mut(address)?;
        eip.status = EipStatus::Bound;
        eip.instance_id = Some(load_balancer.to_string());
        Ok(())
    }

    async fn unbind_eip(&self, address: IpAddr) -> Result<()> {
        let mut state = self.state.lock();
        state.take_failure("unbind_eip")?;
        state.record("unbind_eip", address.to_string());

        let eip = state.eip_mut(address)?;
        eip.status = EipStatus::Available;
        eip.instance_id = None;

        for lb in state.load_balancers.values_mut() {
            if let Some(record) = lb.record.as_mut() {
                if record.public_address == Some(address) {
                    record.public_address = None;
                }
            }
        }
        Ok(())
    }

    async fn resize_eip(&self, address: IpAddr, bandwidth_mbps: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.take_failure("resize_eip")?;
        state.record("resize_eip", format!("{address} {bandwidth_mbps}"));

        state.eip_mut(address)?.bandwidth_mbps = bandwidth_mbps;
        Ok(())
    }

    async fn delete_eip(&self, address: IpAddr) -> Result<()> {
        let mut state = self.state.lock();
        state.take_failure("delete_eip")?;
        state.record("delete_eip", address.to_string());

        if state.eip_mut(address)?.status == EipStatus::Bound {
            return Err(CloudError::Conflict(format!("eip {address} is still bound")));
        }
        state.eips.remove(&address);
        state.eip_status_scripts.remove(&address);
        Ok(())
    }

    async fn get_eip(&self, address: IpAddr) -> Result<Eip> {
        let mut state = self.state.lock();
        state.take_failure("get_eip")?;
        let scripted = state
            .eip_status_scripts
            .get_mut(&address)
            .and_then(VecDeque::pop_front);
        let eip = state.eip_mut(address)?;
        if let Some(status) = scripted {
            eip.status = status;
        }
        Ok(eip.clone())
    }

    async fn find_eips_by_name(&self, name: &str) -> Result<Vec<Eip>> {
        let mut state = self.state.lock();
        state.take_failure("find_eips_by_name")?;
        Ok(state
            .eips
            .values()
            .filter(|eip| eip.name == name)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl VpcApi for MockCloud {
    async fn describe_subnet(&self, id: &SubnetId) -> Result<Subnet> {
        let mut state = self.state.lock();
        state.take_failure("describe_subnet")?;
        state
            .subnets
            .iter()
            .find(|s| &s.id == id)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("subnet {id}")))
    }

    async fn list_subnets(&self, vpc: &VpcId) -> Result<Vec<Subnet>> {
        let mut state = self.state.lock();
        state.take_failure("list_subnets")?;
        Ok(state
            .subnets
            .iter()
            .filter(|s| &s.vpc_id == vpc)
            .cloned()
            .collect())
    }

    async fn create_subnet(&self, args: &CreateSubnetArgs) -> Result<SubnetId> {
        let mut state = self.state.lock();
        state.take_failure("create_subnet")?;
        state.record("create_subnet", format!("{} {}", args.name, args.cidr));

        let clash = state.subnets.iter().any(|s| {
            s.vpc_id == args.vpc_id && (s.cidr.contains(&args.cidr) || args.cidr.contains(&s.cidr))
        });
        if clash {
            return Err(CloudError::Conflict(format!("cidr {} overlaps", args.cidr)));
        }

        let n = state.next_id();
        let id = SubnetId::new(format!("sbn-{n:04}"))
            .map_err(|e| CloudError::Decode(e.to_string()))?;
        state.subnets.push(Subnet {
            id: id.clone(),
            name: args.name.clone(),
            cidr: args.cidr,
            vpc_id: args.vpc_id.clone(),
            zone: args.zone.clone(),
            subnet_type: args.subnet_type,
        });
        Ok(id)
    }

    async fn list_route_tables(&self, vpc: &VpcId) -> Result<Vec<RouteTable>> {
        let mut state = self.state.lock();
        state.take_failure("list_route_tables")?;
        Ok(state
            .route_tables
            .iter()
            .filter(|t| &t.vpc_id == vpc)
            .cloned()
            .collect())
    }

    async fn create_route_rule(&self, args: &CreateRouteRuleArgs) -> Result<RouteRuleId> {
        let mut state = self.state.lock();
        state.take_failure("create_route_rule")?;
        state.record(
            "create_route_rule",
            format!("{} -> {}", args.destination, args.next_hop_id),
        );

        let n = state.next_id();
        let id = RouteRuleId::new(format!("rr-{n:04}"))
            .map_err(|e| CloudError::Decode(e.to_string()))?;
        let table = state
            .route_tables
            .iter_mut()
            .find(|t| t.id == args.route_table_id)
            .ok_or_else(|| CloudError::NotFound(format!("route table {}", args.route_table_id)))?;
        table.rules.push(RouteRule {
            route_rule_id: id.clone(),
            route_table_id: args.route_table_id.clone(),
            source: args.source,
            destination: args.destination,
            next_hop_id: args.next_hop_id.clone(),
            next_hop_type: args.next_hop_type,
            description: args.description.clone(),
        });
        Ok(id)
    }

    async fn delete_route_rule(&self, id: &RouteRuleId) -> Result<()> {
        let mut state = self.state.lock();
        state.take_failure("delete_route_rule")?;
        state.record("delete_route_rule", id.to_string());

        for table in &mut state.route_tables {
            if let Some(pos) = table.rules.iter().position(|r| &r.route_rule_id == id) {
                table.rules.remove(pos);
                return Ok(());
            }
        }
        Err(CloudError::NotFound(format!("route rule {id}")))
    }
}

#[async_trait]
impl ClusterApi for MockCloud {
    async fn list_nodes(&self, _cluster: &ClusterId) -> Result<Vec<ClusterNode>> {
        let mut state = self.state.lock();
        state.take_failure("list_nodes")?;
        Ok(state.nodes.clone())
    }
}
