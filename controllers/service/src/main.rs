//! Service Controller
//!
//! Watches Kubernetes services and keeps one gateway Upstream per service
//! port in the configured storage backend. Generated upstream names are a
//! deterministic function of (namespace, service, port), so repeated
//! passes over unchanged state issue no writes.

mod controller;
mod error;
mod reconciler;
mod storage;

use crate::controller::ServiceController;
use crate::error::ServiceControllerError;
use crate::storage::storage_from_env;
use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client};
use std::env;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), ServiceControllerError> {
    tracing_subscriber::fmt::init();

    info!("Starting service controller");

    let namespace = env::var("WATCH_NAMESPACE").ok();
    let generated_by =
        env::var("GENERATED_BY").unwrap_or_else(|_| "service-controller".to_string());
    let resync_period = env::var("SYNC_FREQUENCY_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(60));

    info!("Configuration:");
    info!("  Namespace: {}", namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Owner identifier: {generated_by}");

    let client = Client::try_default().await?;
    let services: Api<Service> = match namespace.as_deref() {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let upstreams = storage_from_env(client)?.upstreams;

    let mut controller =
        ServiceController::new(services, upstreams, generated_by, resync_period);

    if let Some(mut errors) = controller.take_errors() {
        tokio::spawn(async move {
            while let Some(err) = errors.recv().await {
                error!("{err}");
            }
        });
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = stop_tx.send(true);
        }
    });

    controller.run(2, stop_rx).await?;
    info!("Service controller stopped");
    Ok(())
}
