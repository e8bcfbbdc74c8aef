//! Watchers feeding the work queues, and the handlers draining them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use blb_reconcile::{
    run_workers, ErrorClass, LoadBalancerReconciler, ReconcileError, RouteReconciler, ServiceKey,
    WorkQueue,
};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::Api;
use kube::runtime::watcher::{self, watcher, Config as WatcherConfig};
use kube::Client;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{is_load_balancer, pod_cidr, NodeChange, ObjectCache, ServiceTarget};
use crate::config::ControllerConfig;
use crate::store::{KubeAnnotationStore, KubeEventRecorder};

/// Reason attached to Service warning events.
pub const SYNC_FAILED_REASON: &str = "SyncLoadBalancerFailed";

/// Reason attached to Service warning events on teardown.
pub const DELETE_FAILED_REASON: &str = "DeleteLoadBalancerFailed";

/// The controller: two watchers, two queues, two worker pools.
pub struct Controller {
    client: Client,
    config: ControllerConfig,
    cache: ObjectCache,
    load_balancers: Arc<LoadBalancerReconciler>,
    routes: Arc<RouteReconciler>,
    store: KubeAnnotationStore,
    recorder: KubeEventRecorder,
    service_queue: WorkQueue<ServiceKey>,
    route_queue: WorkQueue<String>,
    services_synced: AtomicBool,
    nodes_synced: AtomicBool,
}

impl Controller {
    /// Create a controller.
    #[must_use]
    pub fn new(
        client: Client,
        config: ControllerConfig,
        load_balancers: Arc<LoadBalancerReconciler>,
        routes: Arc<RouteReconciler>,
        store: KubeAnnotationStore,
        recorder: KubeEventRecorder,
    ) -> Self {
        let service_queue = WorkQueue::new(config.backoff);
        let route_queue = WorkQueue::new(config.backoff);
        Self {
            client,
            config,
            cache: ObjectCache::new(),
            load_balancers,
            routes,
            store,
            recorder,
            service_queue,
            route_queue,
            services_synced: AtomicBool::new(false),
            nodes_synced: AtomicBool::new(false),
        }
    }

    /// Whether both watchers finished their initial listing.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.services_synced.load(Ordering::Acquire) && self.nodes_synced.load(Ordering::Acquire)
    }

    /// Run watchers, workers and the periodic route audit until a watcher
    /// exits.
    pub async fn run(self: Arc<Self>) {
        let service_workers = {
            let this = Arc::clone(&self);
            run_workers(&self.service_queue, self.config.service_workers, move |key| {
                let this = Arc::clone(&this);
                async move { this.sync_service(key).await }
            })
        };
        let route_workers = {
            let this = Arc::clone(&self);
            run_workers(&self.route_queue, self.config.route_workers, move |name| {
                let this = Arc::clone(&this);
                async move { this.sync_route(name).await }
            })
        };
        info!(
            service_workers = service_workers.len(),
            route_workers = route_workers.len(),
            "Started workers"
        );

        tokio::select! {
            () = self.run_service_watcher() => {}
            () = self.run_node_watcher() => {}
            () = self.run_route_audit() => {}
        }

        self.service_queue.shut_down();
        self.route_queue.shut_down();
        join_workers(service_workers.into_iter().chain(route_workers)).await;
    }

    // ========================================================================
    // Watchers
    // ========================================================================

    async fn run_service_watcher(&self) {
        let services: Api<Service> = Api::all(self.client.clone());
        let watch = watcher(services, WatcherConfig::default());
        futures::pin_mut!(watch);

        info!("Starting Service watcher");

        while let Some(event) = watch.next().await {
            match event {
                Ok(watcher::Event::Apply(service) | watcher::Event::InitApply(service)) => {
                    let key = ServiceKey::of(&service);
                    if self.cache.apply_service(service) {
                        self.service_queue.add(key);
                    }
                }
                Ok(watcher::Event::Delete(service)) => {
                    let key = ServiceKey::of(&service);
                    if self.cache.delete_service(service) {
                        self.service_queue.add(key);
                    }
                }
                Ok(watcher::Event::Init) => {
                    debug!("Service watcher initialized");
                }
                Ok(watcher::Event::InitDone) => {
                    self.services_synced.store(true, Ordering::Release);
                    info!("Initial Service listing complete");
                }
                Err(e) => {
                    debug!(error = %e, "Service watcher error, will retry");
                }
            }
        }

        warn!("Service watcher exited unexpectedly");
    }

    async fn run_node_watcher(&self) {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let watch = watcher(nodes, WatcherConfig::default());
        futures::pin_mut!(watch);

        info!("Starting Node watcher");

        while let Some(event) = watch.next().await {
            match event {
                Ok(watcher::Event::Apply(node) | watcher::Event::InitApply(node)) => {
                    let name = node.metadata.name.clone().unwrap_or_default();
                    let change = self.cache.apply_node(node);
                    self.enqueue_node_change(name, change);
                }
                Ok(watcher::Event::Delete(node)) => {
                    let name = node.metadata.name.clone().unwrap_or_default();
                    let change = self.cache.delete_node(&node);
                    self.enqueue_node_change(name, change);
                }
                Ok(watcher::Event::Init) => {
                    debug!("Node watcher initialized");
                }
                Ok(watcher::Event::InitDone) => {
                    self.nodes_synced.store(true, Ordering::Release);
                    info!("Initial Node listing complete");
                }
                Err(e) => {
                    debug!(error = %e, "Node watcher error, will retry");
                }
            }
        }

        warn!("Node watcher exited unexpectedly");
    }

    fn enqueue_node_change(&self, name: String, change: NodeChange) {
        if change.backends {
            for key in self.cache.service_keys() {
                self.service_queue.add(key);
            }
        }
        if change.route && !name.is_empty() {
            self.route_queue.add(name);
        }
    }

    /// List managed routes periodically, which also audits the route tables
    /// for conflicts.
    async fn run_route_audit(&self) {
        let mut ticker = tokio::time::interval(self.config.route_audit_interval);
        loop {
            ticker.tick().await;
            if !self.is_ready() {
                continue;
            }
            match self.routes.list_managed_routes(&self.cache.nodes()).await {
                Ok(routes) => {
                    let blackholes = routes.iter().filter(|r| r.blackhole).count();
                    if blackholes > 0 {
                        warn!(routes = routes.len(), blackholes, "Managed routes without a live owner");
                    } else {
                        debug!(routes = routes.len(), "Route audit complete");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Route audit failed");
                }
            }
        }
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Converge the load balancer of one Service key.
    ///
    /// # Errors
    ///
    /// Returns the reconciliation error; terminal and partial failures are
    /// also recorded as a Warning event on the Service.
    pub async fn sync_service(&self, key: ServiceKey) -> blb_reconcile::Result<()> {
        match self.cache.service_target(&key) {
            ServiceTarget::Ensure(service) => {
                let nodes = self.cache.nodes();
                match self.load_balancers.ensure_load_balancer(&service, &nodes).await {
                    Ok(ingress) => {
                        self.publish_ingress(&key, &service, Some(ingress.address)).await?;
                        info!(service = %key, load_balancer_id = %ingress.load_balancer_id, address = %ingress.address, "Load balancer synced");
                        Ok(())
                    }
                    Err(e) => {
                        self.report(&service, SYNC_FAILED_REASON, &e).await;
                        Err(e)
                    }
                }
            }
            ServiceTarget::Delete(service) => {
                match self.load_balancers.ensure_load_balancer_deleted(&service).await {
                    Ok(()) => {
                        self.cache.settle_teardown(&key, None);
                        // The Service may still exist with another type.
                        if !is_load_balancer(&service) && service.metadata.deletion_timestamp.is_none() {
                            self.publish_ingress(&key, &service, None).await?;
                        }
                        info!(service = %key, "Load balancer deleted");
                        Ok(())
                    }
                    Err(e) => {
                        self.report(&service, DELETE_FAILED_REASON, &e).await;
                        if self.cache.settle_teardown(&key, Some(e.classify())) {
                            warn!(service = %key, error = %e, "Giving up on load balancer teardown");
                        }
                        Err(e)
                    }
                }
            }
            ServiceTarget::Skip => {
                debug!(service = %key, "Nothing to reconcile");
                Ok(())
            }
        }
    }

    /// Converge the routes of one node.
    ///
    /// Retired CIDRs are deleted first, then the current one is ensured.
    ///
    /// # Errors
    ///
    /// Returns the first failing route operation.
    pub async fn sync_route(&self, name: String) -> blb_reconcile::Result<()> {
        for cidr in self.cache.retired_cidrs(&name) {
            self.routes.delete_route(&cidr).await?;
            self.cache.forget_retired_cidr(&name, &cidr);
            info!(node = %name, destination = %cidr, "Retired route removed");
        }

        let Some(node) = self.cache.node(&name) else {
            return Ok(());
        };
        let Some(cidr) = pod_cidr(&node) else {
            debug!(node = %name, "Node has no pod CIDR yet");
            return Ok(());
        };
        if let Some(rule_id) = self.routes.ensure_route(&node, cidr).await? {
            debug!(node = %name, destination = %cidr, route_rule_id = %rule_id, "Route synced");
        }
        Ok(())
    }

    async fn publish_ingress(
        &self,
        key: &ServiceKey,
        service: &Service,
        address: Option<std::net::IpAddr>,
    ) -> blb_reconcile::Result<()> {
        let current: Vec<String> = service
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .map(|ingress| ingress.iter().filter_map(|i| i.ip.clone()).collect())
            .unwrap_or_default();
        let desired: Vec<String> = address.iter().map(ToString::to_string).collect();
        if current == desired {
            return Ok(());
        }
        self.store.patch_service_ingress(key, address).await
    }

    async fn report(&self, service: &Service, reason: &str, err: &ReconcileError) {
        if let Some((reason, message)) = failure_event(reason, err) {
            self.recorder.warn_service(service, reason, &message).await;
        }
    }
}

/// Wait for worker tasks to drain, logging any that panicked or were
/// cancelled. Returns how many did.
pub async fn join_workers(handles: impl IntoIterator<Item = JoinHandle<()>>) -> usize {
    let mut abnormal = 0;
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Worker task ended abnormally");
            abnormal += 1;
        }
    }
    abnormal
}

/// The Warning event (reason, message) for a failed reconciliation, if it
/// deserves one.
///
/// Plain retryable failures are only logged by the queue. A partial
/// convergence is always surfaced: the Service is being served by a load
/// balancer that differs from what it asked for.
#[must_use]
pub fn failure_event<'a>(reason: &'a str, err: &ReconcileError) -> Option<(&'a str, String)> {
    let surfaced =
        matches!(err, ReconcileError::Partial(_)) || err.classify() == ErrorClass::Terminal;
    surfaced.then(|| (reason, err.to_string()))
}
