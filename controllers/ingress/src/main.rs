//! Ingress Controller
//!
//! Watches Kubernetes ingresses and converges the configured storage
//! backend onto the Upstreams and VirtualHosts they imply, then keeps each
//! ingress's load-balancer status in step with the gateway proxy Service.
//! Set `GLOBAL_INGRESS=true` to own every ingress in the cluster instead
//! of only the gateway ingress class.

mod controller;
mod error;
mod reconciler;
mod status;
mod storage;

use crate::controller::IngressController;
use crate::error::IngressControllerError;
use crate::reconciler::{INGRESS_CLASS, IngressReconciler, KubeIngressLister};
use crate::status::{KubeIngressStatusClient, StatusSyncer};
use crate::storage::storage_from_env;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, Client};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), IngressControllerError> {
    tracing_subscriber::fmt::init();

    info!("Starting ingress controller");

    let use_as_global_ingress = env::var("GLOBAL_INGRESS")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    let ingress_class = env::var("INGRESS_CLASS").unwrap_or_else(|_| INGRESS_CLASS.to_string());
    let generated_by =
        env::var("GENERATED_BY").unwrap_or_else(|_| "ingress-controller".to_string());
    let resync_period = env::var("SYNC_FREQUENCY_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(60));
    let proxy_service_name =
        env::var("INGRESS_SERVICE_NAME").unwrap_or_else(|_| "gateway-proxy".to_string());
    let proxy_service_namespace =
        env::var("INGRESS_SERVICE_NAMESPACE").unwrap_or_else(|_| "gateway-system".to_string());

    info!("Configuration:");
    info!("  Global ingress: {use_as_global_ingress}");
    info!("  Ingress class: {ingress_class}");
    info!("  Owner identifier: {generated_by}");
    info!("  Proxy service: {proxy_service_namespace}/{proxy_service_name}");

    let client = Client::try_default().await?;
    let ingresses: Api<Ingress> = Api::all(client.clone());
    let proxy_services: Api<Service> =
        Api::namespaced(client.clone(), &proxy_service_namespace);
    let handles = storage_from_env(client.clone())?;

    let reconciler = IngressReconciler::new(
        Arc::new(KubeIngressLister::new(ingresses.clone())),
        handles.upstreams,
        handles.virtual_hosts,
        use_as_global_ingress,
        ingress_class.clone(),
        generated_by,
    );
    let status_syncer = StatusSyncer::new(
        Box::new(KubeIngressStatusClient::new(client)),
        use_as_global_ingress,
        ingress_class,
    );

    let mut controller = IngressController::new(
        ingresses,
        proxy_services,
        proxy_service_name,
        proxy_service_namespace,
        reconciler,
        status_syncer,
        resync_period,
    );

    for errors in [controller.take_errors(), controller.take_status_errors()] {
        if let Some(mut errors) = errors {
            tokio::spawn(async move {
                while let Some(err) = errors.recv().await {
                    error!("{err}");
                }
            });
        }
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = stop_tx.send(true);
        }
    });

    controller.run(2, stop_rx).await?;
    info!("Ingress controller stopped");
    Ok(())
}
