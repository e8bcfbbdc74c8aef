//! BLB Controller - keeps cloud load balancers in sync with Kubernetes
//!
//! This is the main entry point for the controller. It watches Services and
//! Nodes, reconciles load balancers, elastic IPs and pod routes, and serves
//! health endpoints.
//!
//! # HTTP Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /ready` - Ready once the initial Service and Node listings are done

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use blb_cloud::{CloudConfig, HttpCloudClient};
use blb_controller::{
    credentials_from_env, Controller, ControllerConfig, KubeAnnotationStore, KubeEventRecorder,
};
use blb_reconcile::{CloudClients, LoadBalancerReconciler, ReconcilerConfig, RouteReconciler};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ============================================================================
// Health Endpoints
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "blb-controller",
    })
}

async fn ready_handler(State(controller): State<Arc<Controller>>) -> impl IntoResponse {
    if controller.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "syncing")
    }
}

fn create_router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(controller)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,blb=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting BLB Controller");

    // Load configuration from environment
    let config = ControllerConfig::from_env();
    let reconciler_config = Arc::new(ReconcilerConfig::from_env()?);
    let cloud_config = CloudConfig::from_env();

    tracing::info!(
        cluster_id = %reconciler_config.cluster_id,
        region = %cloud_config.region,
        service_workers = config.service_workers,
        route_workers = config.route_workers,
        "Loaded controller configuration"
    );

    let credentials = credentials_from_env(&cloud_config)?;
    let cloud = Arc::new(HttpCloudClient::new(cloud_config, credentials)?);
    let clients = CloudClients::from_shared(cloud);

    let client = kube::Client::try_default().await?;
    tracing::info!("Connected to Kubernetes cluster");

    let store = KubeAnnotationStore::new(client.clone());
    let recorder = KubeEventRecorder::new(client.clone(), config.event_namespace.clone());

    let load_balancers = Arc::new(LoadBalancerReconciler::new(
        clients.clone(),
        Arc::new(store.clone()),
        Arc::clone(&reconciler_config),
    ));
    let routes = Arc::new(RouteReconciler::new(
        clients.vpc,
        clients.cluster,
        Arc::new(store.clone()),
        Arc::new(recorder.clone()),
        reconciler_config,
    ));

    let listen_addr = config.listen_addr.clone();
    let controller = Arc::new(Controller::new(
        client,
        config,
        load_balancers,
        routes,
        store,
        recorder,
    ));

    // Start the controller as a background task
    let running = Arc::clone(&controller);
    tokio::spawn(async move {
        running.run().await;
        tracing::error!("Controller stopped");
    });
    tracing::info!("Started reconciliation loops");

    // Start server
    let app = create_router(controller);
    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
