//! Load balancer lifecycle reconciliation.
//!
//! [`LoadBalancerReconciler`] is the entry point for Service events. It runs
//! the individual reconcilers in dependency order:
//!
//! 1. extract the desired state from the Service,
//! 2. find or create the load balancer (allocating a subnet on creation),
//! 3. converge backends, then listeners,
//! 4. converge the elastic IP, unless the Service asks for the internal
//!    address.
//!
//! Steps 3 and 4 are independent: a failing step does not prevent the
//! others from running, and the failures are reported together as
//! [`ReconcileError::Partial`].

use std::net::IpAddr;
use std::sync::Arc;

use blb_cloud::{
    Backend, CreateLoadBalancerArgs, Listener, LoadBalancer, LoadBalancerStatus,
};
use blb_core::{ClientToken, LoadBalancerId};
use k8s_openapi::api::core::v1::{Node, Service};
use tracing::{debug, info, warn};

use crate::annotations::{
    self, effective_patch, service_annotation, AnnotationPatch, AnnotationStore, ServiceKey,
};
use crate::backends::{
    needs_inventory, reconcile_backends, reconcile_backends_bounded, select_backend_instances,
    BackendChanges,
};
use crate::config::ReconcilerConfig;
use crate::eip::{AddressSources, EipReconciler, Ownership};
use crate::error::{ReconcileError, Result, StepFailure};
use crate::extract::{
    extract, id_annotation, load_balancer_name, pinned_address, wants_internal_address,
    DesiredEipConfig, DesiredLoadBalancerConfig,
};
use crate::lifecycle::{validate_transition, LoadBalancerPhase};
use crate::listeners::{describe_all_listeners, reconcile_listeners};
use crate::retry::poll_until;
use crate::subnet::allocate_subnet_for_lb;
use crate::CloudClients;

/// What a converged Service exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIngress {
    /// The load balancer serving the Service.
    pub load_balancer_id: LoadBalancerId,
    /// The address to publish in the Service status.
    pub address: IpAddr,
}

/// Read-only view of a Service's load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedLoadBalancer {
    /// The load balancer record.
    pub load_balancer: LoadBalancer,
    /// Its layer-4 listeners.
    pub listeners: Vec<Listener>,
    /// Its registered backends.
    pub backends: Vec<Backend>,
    /// The address the Service is reachable at, if any.
    pub ingress: Option<IpAddr>,
}

/// Address recorded in the Service status.
fn status_address(service: &Service) -> Option<IpAddr> {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.iter().find_map(|i| i.ip.as_deref()))
        .and_then(|ip| ip.parse().ok())
}

/// Reconciles the load balancer of each Service.
pub struct LoadBalancerReconciler {
    clients: CloudClients,
    store: Arc<dyn AnnotationStore>,
    config: Arc<ReconcilerConfig>,
}

impl LoadBalancerReconciler {
    /// Create a reconciler.
    pub fn new(
        clients: CloudClients,
        store: Arc<dyn AnnotationStore>,
        config: Arc<ReconcilerConfig>,
    ) -> Self {
        Self {
            clients,
            store,
            config,
        }
    }

    fn eips(&self) -> EipReconciler<'_> {
        EipReconciler::new(
            self.clients.load_balancers.as_ref(),
            self.clients.eips.as_ref(),
            self.config.poll,
        )
    }

    async fn patch_service(&self, key: &ServiceKey, service: &Service, patch: AnnotationPatch) -> Result<()> {
        let patch = effective_patch(service.metadata.annotations.as_ref(), patch);
        if patch.is_empty() {
            return Ok(());
        }
        debug!(service = %key, keys = ?patch.keys().collect::<Vec<_>>(), "Patching service annotations");
        self.store.patch_service_annotations(key, &patch).await
    }

    /// Converge the Service's load balancer and return its ingress.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Validation` for malformed Services,
    /// `ReconcileError::Partial` when some steps failed, and the first error
    /// of the find-or-create step otherwise.
    pub async fn ensure_load_balancer(&self, service: &Service, nodes: &[Node]) -> Result<ServiceIngress> {
        let key = ServiceKey::of(service);
        let (desired, desired_eip) = extract(service, &self.config.cluster_id)?;

        let remembered = desired.existing_load_balancer_id.is_some()
            || desired.cached_load_balancer_id.is_some();
        let phase = LoadBalancerPhase::from_record(remembered);
        let next = if remembered {
            LoadBalancerPhase::Updating
        } else {
            LoadBalancerPhase::Creating
        };
        let mut phase = validate_transition(&key, phase, next)?;

        let lb = self.find_or_create(&key, &desired, &mut phase).await?;

        if desired.existing_load_balancer_id.is_none() {
            let patch = [(annotations::LOAD_BALANCER_ID.to_string(), Some(lb.id.to_string()))]
                .into_iter()
                .collect();
            self.patch_service(&key, service, patch).await?;
        }

        let mut failures = Vec::new();

        if let Err(error) = self.sync_backends(&lb.id, &desired, nodes).await {
            warn!(service = %key, load_balancer_id = %lb.id, error = %error, "Backend reconciliation failed");
            failures.push(StepFailure {
                step: "backends",
                error,
            });
        }

        if let Err(error) = reconcile_listeners(self.clients.load_balancers.as_ref(), &lb.id, &desired.ports).await {
            warn!(service = %key, load_balancer_id = %lb.id, error = %error, "Listener reconciliation failed");
            failures.push(StepFailure {
                step: "listeners",
                error,
            });
        }

        let address = if desired.use_internal_address {
            debug!(service = %key, "Internal address requested, skipping elastic IP");
            lb.address.ok_or_else(|| {
                ReconcileError::NotFound(format!("internal address of load balancer {}", lb.id))
            })
        } else {
            let ownership = if desired.existing_load_balancer_id.is_some() {
                Ownership::User {
                    recorded: service_annotation(service, annotations::AUTO_ADD_EIP)
                        .and_then(|a| a.parse().ok()),
                }
            } else {
                Ownership::Controller
            };
            self.sync_address(&key, service, &lb.id, &desired_eip, ownership).await
        };

        let address = match address {
            Ok(address) => Some(address),
            Err(error) => {
                warn!(service = %key, load_balancer_id = %lb.id, error = %error, "Address reconciliation failed");
                failures.push(StepFailure {
                    step: "address",
                    error,
                });
                None
            }
        };

        match address {
            Some(address) if failures.is_empty() => {
                validate_transition(&key, phase, LoadBalancerPhase::Bound)?;
                info!(service = %key, load_balancer_id = %lb.id, address = %address, "Load balancer converged");
                Ok(ServiceIngress {
                    load_balancer_id: lb.id,
                    address,
                })
            }
            _ => Err(ReconcileError::Partial(failures)),
        }
    }

    async fn find_or_create(
        &self,
        key: &ServiceKey,
        desired: &DesiredLoadBalancerConfig,
        phase: &mut LoadBalancerPhase,
    ) -> Result<LoadBalancer> {
        let api = self.clients.load_balancers.as_ref();

        if let Some(id) = &desired.existing_load_balancer_id {
            return match api.describe_load_balancer(id).await {
                Ok(lb) => Ok(lb),
                Err(e) if e.is_not_found() => Err(ReconcileError::NotFound(format!(
                    "user-supplied load balancer {id} does not exist"
                ))),
                Err(e) => Err(e.into()),
            };
        }

        if let Some(id) = &desired.cached_load_balancer_id {
            match api.describe_load_balancer(id).await {
                Ok(lb) => return Ok(lb),
                Err(e) if e.is_not_found() => {
                    warn!(service = %key, load_balancer_id = %id, "Remembered load balancer is gone, recreating");
                    *phase = validate_transition(key, *phase, LoadBalancerPhase::Creating)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut found = api.describe_load_balancers_by_name(&desired.name).await?;
        if !found.is_empty() {
            if found.len() > 1 {
                warn!(service = %key, name = %desired.name, count = found.len(), "Several load balancers share the name, using the first");
            }
            let lb = found.swap_remove(0);
            debug!(service = %key, load_balancer_id = %lb.id, "Found load balancer by name");
            return Ok(lb);
        }

        self.create(key, desired).await
    }

    async fn create(&self, key: &ServiceKey, desired: &DesiredLoadBalancerConfig) -> Result<LoadBalancer> {
        let api = self.clients.load_balancers.as_ref();
        let (vpc_id, subnet_id) = allocate_subnet_for_lb(
            self.clients.vpc.as_ref(),
            self.clients.cluster.as_ref(),
            &self.config,
            desired.subnet_id.as_ref(),
        )
        .await?;

        let created = api
            .create_load_balancer(&CreateLoadBalancerArgs {
                name: desired.name.clone(),
                vpc_id,
                subnet_id,
                description: String::new(),
                client_token: ClientToken::generate(),
            })
            .await?;
        info!(service = %key, load_balancer_id = %created.id, name = %desired.name, "Created load balancer");

        if created.status == LoadBalancerStatus::Available {
            return Ok(created);
        }

        let id = &created.id;
        poll_until(self.config.poll, "load balancer available", || async move {
            let lb = api.describe_load_balancer(id).await?;
            Ok::<_, ReconcileError>((lb.status == LoadBalancerStatus::Available).then_some(lb))
        })
        .await
    }

    async fn sync_backends(
        &self,
        id: &LoadBalancerId,
        desired: &DesiredLoadBalancerConfig,
        nodes: &[Node],
    ) -> Result<BackendChanges> {
        let inventory = if needs_inventory(nodes) {
            self.clients.cluster.list_nodes(&self.config.cluster_id).await?
        } else {
            Vec::new()
        };
        let candidates = select_backend_instances(nodes, &desired.backend_selector, &inventory);
        let api = self.clients.load_balancers.as_ref();
        match desired.max_backends {
            Some(target) => {
                reconcile_backends_bounded(api, id, &candidates, target, self.config.backend_weight).await
            }
            None => {
                let desired = candidates.into_iter().collect();
                reconcile_backends(api, id, &desired, self.config.backend_weight).await
            }
        }
    }

    async fn sync_address(
        &self,
        key: &ServiceKey,
        service: &Service,
        id: &LoadBalancerId,
        desired: &DesiredEipConfig,
        ownership: Ownership,
    ) -> Result<IpAddr> {
        // Listener and backend calls may have changed the record
        let lb = self.clients.load_balancers.describe_load_balancer(id).await?;
        let bound = self.eips().ensure_address(&lb, desired, ownership).await?;

        let recorded = bound.allocated.then(|| bound.address.to_string());
        let patch = [(annotations::AUTO_ADD_EIP.to_string(), recorded)]
            .into_iter()
            .collect();
        self.patch_service(key, service, patch).await?;
        Ok(bound.address)
    }

    /// Release everything the Service's load balancer holds.
    ///
    /// A user-supplied load balancer is never deleted: only the address the
    /// controller allocated for it (or a pinned one, unbound only) is
    /// released and the annotations removed. Otherwise listeners, backends,
    /// the load balancer and the address are deleted in that order.
    ///
    /// # Errors
    ///
    /// Returns the first failing step; the remaining steps are retried on
    /// the next attempt.
    pub async fn ensure_load_balancer_deleted(&self, service: &Service) -> Result<()> {
        let key = ServiceKey::of(service);
        let existing: Option<LoadBalancerId> =
            id_annotation(service, annotations::EXISTING_LOAD_BALANCER_ID)?;
        let cached: Option<LoadBalancerId> = id_annotation(service, annotations::LOAD_BALANCER_ID)?;

        let phase = LoadBalancerPhase::from_record(existing.is_some() || cached.is_some());
        let phase = validate_transition(&key, phase, LoadBalancerPhase::Deleting)?;

        let internal = wants_internal_address(service);
        let mut sources = AddressSources {
            pinned: pinned_address(service).ok().flatten(),
            status: if internal { None } else { status_address(service) },
            load_balancer: None,
            annotation: service_annotation(service, annotations::AUTO_ADD_EIP)
                .and_then(|a| a.parse().ok()),
        };

        let api = self.clients.load_balancers.as_ref();
        if let Some(id) = &existing {
            // Whatever else is bound belongs to the load balancer's owner.
            sources.status = None;
            info!(service = %key, load_balancer_id = %id, "Keeping user-supplied load balancer");
            self.eips().ensure_address_deleted(&sources).await?;
        } else {
            let lb = match &cached {
                Some(id) => match api.describe_load_balancer(id).await {
                    Ok(lb) => Some(lb),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e.into()),
                },
                None => {
                    let name = load_balancer_name(&self.config.cluster_id, &key);
                    api.describe_load_balancers_by_name(&name).await?.into_iter().next()
                }
            };

            if let Some(lb) = lb {
                sources.load_balancer = lb.public_address;
                self.delete_load_balancer(&key, &lb).await?;
            } else {
                debug!(service = %key, "Load balancer already gone");
            }
            self.eips().ensure_address_deleted(&sources).await?;
        }

        let patch = [
            (annotations::LOAD_BALANCER_ID.to_string(), None),
            (annotations::AUTO_ADD_EIP.to_string(), None),
        ]
        .into_iter()
        .collect();
        self.patch_service(&key, service, patch).await?;

        validate_transition(&key, phase, LoadBalancerPhase::NoRecord)?;
        info!(service = %key, "Load balancer deleted");
        Ok(())
    }

    async fn delete_load_balancer(&self, key: &ServiceKey, lb: &LoadBalancer) -> Result<()> {
        let api = self.clients.load_balancers.as_ref();

        let ports: Vec<u16> = describe_all_listeners(api, &lb.id)
            .await?
            .iter()
            .map(|l| l.port)
            .collect();
        if !ports.is_empty() {
            info!(service = %key, load_balancer_id = %lb.id, ports = ?ports, "Deleting listeners");
            api.delete_listeners(&lb.id, &ports).await?;
        }

        let instances: Vec<_> = api
            .describe_backends(&lb.id)
            .await?
            .into_iter()
            .map(|b| b.instance_id)
            .collect();
        if !instances.is_empty() {
            info!(service = %key, load_balancer_id = %lb.id, count = instances.len(), "Removing backends");
            api.remove_backends(&lb.id, &instances).await?;
        }

        info!(service = %key, load_balancer_id = %lb.id, "Deleting load balancer");
        match api.delete_load_balancer(&lb.id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Describe the Service's load balancer without changing anything.
    ///
    /// Returns `None` when no load balancer is remembered or it no longer
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a remembered id is malformed or a remote call fails.
    pub async fn get_load_balancer(&self, service: &Service) -> Result<Option<ObservedLoadBalancer>> {
        let existing: Option<LoadBalancerId> =
            id_annotation(service, annotations::EXISTING_LOAD_BALANCER_ID)?;
        let cached: Option<LoadBalancerId> = id_annotation(service, annotations::LOAD_BALANCER_ID)?;
        let Some(id) = existing.or(cached) else {
            return Ok(None);
        };

        let api = self.clients.load_balancers.as_ref();
        let load_balancer = match api.describe_load_balancer(&id).await {
            Ok(lb) => lb,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let listeners = describe_all_listeners(api, &id).await?;
        let backends = api.describe_backends(&id).await?;
        let ingress = if wants_internal_address(service) {
            load_balancer.address
        } else {
            load_balancer.public_address
        };

        Ok(Some(ObservedLoadBalancer {
            load_balancer,
            listeners,
            backends,
            ingress,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::MemoryAnnotationStore;
    use blb_cloud::{
        BillingMethod, ClusterNode, Eip, EipStatus, InstanceStatus, LoadBalancerApi, MockCloud,
        PaymentTiming, Protocol, Subnet, SubnetType,
    };
    use blb_core::{ClusterId, InstanceId, SubnetId, VpcId};
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, NodeCondition, NodeSpec, NodeStatus, ServicePort, ServiceSpec,
        ServiceStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    struct Fixture {
        cloud: Arc<MockCloud>,
        store: Arc<MemoryAnnotationStore>,
        reconciler: LoadBalancerReconciler,
    }

    fn fixture() -> Fixture {
        let cloud = Arc::new(MockCloud::new());
        cloud.insert_subnet(Subnet {
            id: SubnetId::new("sbn-1").unwrap(),
            name: "nodes".into(),
            cidr: "192.168.0.0/24".parse().unwrap(),
            vpc_id: VpcId::new("vpc-1").unwrap(),
            zone: "zoneA".into(),
            subnet_type: SubnetType::Bcc,
        });
        cloud.insert_node(ClusterNode {
            instance_id: InstanceId::new("i-1").unwrap(),
            internal_ip: "192.168.0.10".parse().unwrap(),
            hostname: "n1".into(),
            vpc_id: VpcId::new("vpc-1").unwrap(),
            subnet_id: SubnetId::new("sbn-1").unwrap(),
            zone: "zoneA".into(),
            status: InstanceStatus::Running,
        });
        let store = Arc::new(MemoryAnnotationStore::new());
        let reconciler = LoadBalancerReconciler::new(
            CloudClients::from_shared(Arc::clone(&cloud)),
            store.clone(),
            Arc::new(ReconcilerConfig::new(ClusterId::new("c-1").unwrap())),
        );
        Fixture {
            cloud,
            store,
            reconciler,
        }
    }

    fn service(annotations: &[(&str, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("default".into()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".into()),
                ports: Some(vec![ServicePort {
                    port: 80,
                    protocol: Some("TCP".into()),
                    node_port: Some(30080),
                    ..ServicePort::default()
                }]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    fn node(name: &str, instance: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..ObjectMeta::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(format!("cce://{instance}")),
                ..NodeSpec::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: "True".into(),
                    ..NodeCondition::default()
                }]),
                ..NodeStatus::default()
            }),
        }
    }

    #[tokio::test]
    async fn creates_everything_in_order() {
        let f = fixture();
        let svc = service(&[]);

        let ingress = f
            .reconciler
            .ensure_load_balancer(&svc, &[node("n1", "i-1")])
            .await
            .unwrap();

        let lb = f.cloud.load_balancer(&ingress.load_balancer_id).unwrap();
        assert_eq!(lb.name, "c-1/default/web");
        assert_eq!(lb.public_address, Some(ingress.address));
        assert_eq!(f.cloud.backends(&lb.id).len(), 1);
        assert_eq!(f.cloud.listeners(&lb.id)[0].protocol, Protocol::Tcp);
        assert_eq!(f.cloud.eip(ingress.address).unwrap().status, EipStatus::Bound);

        let annotations = f.store.service_annotations(&ServiceKey::new("default", "web"));
        assert_eq!(
            annotations.get(annotations::LOAD_BALANCER_ID),
            Some(&lb.id.to_string())
        );
        assert_eq!(
            annotations.get(annotations::AUTO_ADD_EIP),
            Some(&ingress.address.to_string())
        );

        let ops: Vec<&str> = f.cloud.calls().iter().map(|c| c.op).collect();
        let position = |op: &str| ops.iter().position(|o| *o == op).unwrap();
        assert!(position("create_load_balancer") < position("add_backends"));
        assert!(position("add_backends") < position("create_listener"));
        assert!(position("create_listener") < position("create_eip"));
        assert!(position("create_eip") < position("bind_eip"));
    }

    #[tokio::test]
    async fn missing_user_load_balancer_is_terminal() {
        let f = fixture();
        let svc = service(&[(annotations::EXISTING_LOAD_BALANCER_ID, "lb-missing")]);

        let err = f.reconciler.ensure_load_balancer(&svc, &[]).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_retriable());
        assert_eq!(f.cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn vanished_load_balancer_is_recreated() {
        let f = fixture();
        let svc = service(&[(annotations::LOAD_BALANCER_ID, "lb-gone")]);

        let ingress = f.reconciler.ensure_load_balancer(&svc, &[]).await.unwrap();

        assert_ne!(ingress.load_balancer_id.as_str(), "lb-gone");
        assert_eq!(f.cloud.count("create_load_balancer"), 1);
    }

    #[tokio::test]
    async fn failing_listener_does_not_block_address() {
        let f = fixture();
        f.cloud.fail_next(
            "create_listener",
            blb_cloud::CloudError::Transient {
                status: 500,
                message: "boom".into(),
            },
        );

        let err = f
            .reconciler
            .ensure_load_balancer(&service(&[]), &[node("n1", "i-1")])
            .await
            .unwrap_err();

        let ReconcileError::Partial(failures) = &err else {
            panic!("expected partial convergence, got {err:?}");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].step, "listeners");
        assert!(err.is_retriable());
        assert_eq!(f.cloud.count("bind_eip"), 1);
    }

    #[tokio::test]
    async fn deletion_follows_strict_order() {
        let f = fixture();
        let mut svc = service(&[]);
        let ingress = f
            .reconciler
            .ensure_load_balancer(&svc, &[node("n1", "i-1")])
            .await
            .unwrap();
        f.store.apply_to_service(&mut svc);
        with_ingress(&mut svc, ingress.address);
        f.cloud.clear_calls();

        f.reconciler.ensure_load_balancer_deleted(&svc).await.unwrap();

        let ops: Vec<&str> = f.cloud.calls().iter().map(|c| c.op).collect();
        assert_eq!(
            ops,
            vec![
                "delete_listeners",
                "remove_backends",
                "delete_load_balancer",
                "delete_eip"
            ]
        );
        assert!(f.cloud.load_balancers().is_empty());
        assert!(f.cloud.eips().is_empty());
        assert!(f
            .store
            .service_annotations(&ServiceKey::new("default", "web"))
            .is_empty());
    }

    #[tokio::test]
    async fn user_load_balancer_survives_deletion() {
        let f = fixture();
        let lb = f
            .cloud
            .create_load_balancer(&CreateLoadBalancerArgs {
                name: "mine".into(),
                vpc_id: VpcId::new("vpc-1").unwrap(),
                subnet_id: SubnetId::new("sbn-1").unwrap(),
                description: String::new(),
                client_token: ClientToken::generate(),
            })
            .await
            .unwrap();
        let mut svc = service(&[(annotations::EXISTING_LOAD_BALANCER_ID, lb.id.as_str())]);
        let ingress = f.reconciler.ensure_load_balancer(&svc, &[]).await.unwrap();
        assert_eq!(ingress.load_balancer_id, lb.id);
        f.store.apply_to_service(&mut svc);

        f.reconciler.ensure_load_balancer_deleted(&svc).await.unwrap();

        let kept = f.cloud.load_balancer(&lb.id).unwrap();
        assert_eq!(kept.public_address, None);
        assert!(f.cloud.eip(ingress.address).is_none());
        assert_eq!(f.cloud.count("delete_load_balancer"), 0);
    }

    fn with_ingress(svc: &mut Service, address: IpAddr) {
        svc.status = Some(ServiceStatus {
            load_balancer: Some(k8s_openapi::api::core::v1::LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some(address.to_string()),
                    ..LoadBalancerIngress::default()
                }]),
            }),
            ..ServiceStatus::default()
        });
    }

    #[tokio::test]
    async fn user_address_on_user_load_balancer_is_left_alone() {
        let f = fixture();
        let id = LoadBalancerId::new("lb-user").unwrap();
        let address: IpAddr = "180.76.1.1".parse().unwrap();
        f.cloud.insert_load_balancer(LoadBalancer {
            id: id.clone(),
            name: "prod-ingress".into(),
            status: LoadBalancerStatus::Available,
            address: Some("192.168.0.5".parse().unwrap()),
            public_address: Some(address),
            description: "prod".into(),
            vpc_id: Some(VpcId::new("vpc-1").unwrap()),
            subnet_id: Some(SubnetId::new("sbn-1").unwrap()),
        });
        f.cloud.insert_eip(Eip {
            address,
            name: "prod-eip".into(),
            status: EipStatus::Bound,
            payment_timing: PaymentTiming::Postpaid,
            billing_method: Some(BillingMethod::ByTraffic),
            bandwidth_mbps: 100,
            instance_id: Some(id.to_string()),
        });
        let mut svc = service(&[(annotations::EXISTING_LOAD_BALANCER_ID, "lb-user")]);

        let ingress = f.reconciler.ensure_load_balancer(&svc, &[]).await.unwrap();

        assert_eq!(ingress.load_balancer_id, id);
        assert_eq!(ingress.address, address);
        for op in ["unbind_eip", "create_eip", "bind_eip", "update_load_balancer"] {
            assert_eq!(f.cloud.count(op), 0, "unexpected {op}");
        }
        assert_eq!(f.cloud.load_balancer(&id).unwrap().description, "prod");
        let key = ServiceKey::new("default", "web");
        assert!(!f.store.service_annotations(&key).contains_key(annotations::AUTO_ADD_EIP));

        // Teardown leaves the user's address where it was.
        f.store.apply_to_service(&mut svc);
        with_ingress(&mut svc, address);
        f.reconciler.ensure_load_balancer_deleted(&svc).await.unwrap();

        assert_eq!(f.cloud.count("unbind_eip"), 0);
        assert_eq!(f.cloud.count("delete_eip"), 0);
        assert_eq!(f.cloud.eip(address).unwrap().status, EipStatus::Bound);
        assert_eq!(f.cloud.load_balancer(&id).unwrap().public_address, Some(address));
    }

    #[tokio::test]
    async fn get_without_record_is_none() {
        let f = fixture();
        assert!(f.reconciler.get_load_balancer(&service(&[])).await.unwrap().is_none());

        let svc = service(&[(annotations::LOAD_BALANCER_ID, "lb-gone")]);
        assert!(f.reconciler.get_load_balancer(&svc).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_reports_observed_state() {
        let f = fixture();
        let mut svc = service(&[]);
        let ingress = f
            .reconciler
            .ensure_load_balancer(&svc, &[node("n1", "i-1")])
            .await
            .unwrap();
        f.store.apply_to_service(&mut svc);
        f.cloud.clear_calls();

        let observed = f.reconciler.get_load_balancer(&svc).await.unwrap().unwrap();
        assert_eq!(observed.load_balancer.id, ingress.load_balancer_id);
        assert_eq!(observed.ingress, Some(ingress.address));
        assert_eq!(observed.listeners.len(), 1);
        assert_eq!(observed.backends.len(), 1);
        assert_eq!(f.cloud.mutation_count(), 0);
    }
}
