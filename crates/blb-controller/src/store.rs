//! Kubernetes-backed annotation store and event recorder.

use std::net::IpAddr;

use async_trait::async_trait;
use blb_reconcile::{AnnotationPatch, AnnotationStore, EventRecorder, ReconcileError, ServiceKey};
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, Node, ObjectReference, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

/// Component name attached to events and patches.
pub const COMPONENT: &str = "blb-controller";

/// JSON merge patch body for an annotation patch; removals become `null`.
#[must_use]
pub fn annotation_patch_body(patch: &AnnotationPatch) -> Value {
    let annotations: Map<String, Value> = patch
        .iter()
        .map(|(k, v)| (k.clone(), v.clone().map_or(Value::Null, Value::String)))
        .collect();
    json!({ "metadata": { "annotations": annotations } })
}

/// Status patch body publishing the ingress address of a Service.
///
/// `None` clears the ingress list.
#[must_use]
pub fn ingress_status_body(address: Option<IpAddr>) -> Value {
    let ingress: Vec<Value> = address
        .map(|ip| json!({ "ip": ip.to_string() }))
        .into_iter()
        .collect();
    json!({ "status": { "loadBalancer": { "ingress": ingress } } })
}

fn map_patch_result<T>(result: kube::Result<T>, object: &str) -> blb_reconcile::Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => {
            debug!(object, "Object gone, dropping annotation patch");
            Ok(())
        }
        Err(e) => Err(ReconcileError::Store(format!("patching {object}: {e}"))),
    }
}

/// Writes annotation patches to Service and Node objects.
#[derive(Clone)]
pub struct KubeAnnotationStore {
    client: Client,
}

impl KubeAnnotationStore {
    /// Create a store backed by the given client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Publish the ingress address on a Service's status.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError::Store` if the status patch is rejected.
    pub async fn patch_service_ingress(
        &self,
        key: &ServiceKey,
        address: Option<IpAddr>,
    ) -> blb_reconcile::Result<()> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &key.namespace);
        let body = ingress_status_body(address);
        let result = services
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&body))
            .await;
        map_patch_result(result, &format!("service {key} status"))
    }
}

#[async_trait]
impl AnnotationStore for KubeAnnotationStore {
    async fn patch_service_annotations(
        &self,
        key: &ServiceKey,
        patch: &AnnotationPatch,
    ) -> blb_reconcile::Result<()> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &key.namespace);
        let body = annotation_patch_body(patch);
        let result = services
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&body))
            .await;
        map_patch_result(result, &format!("service {key}"))
    }

    async fn patch_node_annotations(
        &self,
        node: &str,
        patch: &AnnotationPatch,
    ) -> blb_reconcile::Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let body = annotation_patch_body(patch);
        let result = nodes
            .patch(node, &PatchParams::default(), &Patch::Merge(&body))
            .await;
        map_patch_result(result, &format!("node {node}"))
    }
}

/// Reference to a Service for event attribution.
#[must_use]
pub fn service_reference(service: &Service) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Service".to_string()),
        namespace: service.metadata.namespace.clone(),
        name: service.metadata.name.clone(),
        uid: service.metadata.uid.clone(),
        ..ObjectReference::default()
    }
}

/// Reference to a namespace, used for cluster-wide findings.
#[must_use]
pub fn namespace_reference(namespace: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Namespace".to_string()),
        name: Some(namespace.to_string()),
        ..ObjectReference::default()
    }
}

/// Build a `Warning` event about `target`.
#[must_use]
pub fn warning_event(target: &ObjectReference, namespace: &str, reason: &str, message: &str) -> Event {
    let now = Time(Utc::now());
    let base = target.name.as_deref().unwrap_or("cluster");
    Event {
        metadata: ObjectMeta {
            name: Some(format!("{base}.{}", uuid::Uuid::new_v4().simple())),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        involved_object: target.clone(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        type_: Some("Warning".to_string()),
        first_timestamp: Some(now.clone()),
        last_timestamp: Some(now),
        count: Some(1),
        source: Some(EventSource {
            component: Some(COMPONENT.to_string()),
            host: None,
        }),
        reporting_component: Some(COMPONENT.to_string()),
        ..Event::default()
    }
}

/// Records warnings as Kubernetes events.
///
/// Object-agnostic warnings from the engine (route conflicts) are attached
/// to the configured namespace; Service failures go to the Service itself.
#[derive(Clone)]
pub struct KubeEventRecorder {
    client: Client,
    namespace: String,
}

impl KubeEventRecorder {
    /// Create a recorder writing cluster-wide events to `namespace`.
    #[must_use]
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    async fn publish(&self, namespace: &str, event: &Event) {
        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        if let Err(e) = events.create(&PostParams::default(), event).await {
            // Event delivery is best effort.
            warn!(error = %e, reason = ?event.reason, "Failed to record event");
        }
    }

    /// Record a warning on a Service.
    pub async fn warn_service(&self, service: &Service, reason: &str, message: &str) {
        let namespace = service.metadata.namespace.as_deref().unwrap_or("default");
        let event = warning_event(&service_reference(service), namespace, reason, message);
        self.publish(namespace, &event).await;
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn warn(&self, reason: &str, message: &str) {
        let event = warning_event(&namespace_reference(&self.namespace), &self.namespace, reason, message);
        self.publish(&self.namespace, &event).await;
    }
}
