//! Controller wiring.
//!
//! Two event paths run side by side: ingress changes trigger the
//! reconciler, and changes to the gateway proxy Service trigger the status
//! syncer. Each has its own queue and workers; a periodic resync re-runs
//! the reconciler even without events.

use crate::reconciler::IngressReconciler;
use crate::status::StatusSyncer;
use controller_core::{ControllerError, EventHandler, KubeSource, ResourceController};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

/// Converges ingress rules into gateway objects and keeps ingress statuses
/// in step with the proxy service.
pub struct IngressController {
    ingress_controller: ResourceController<Ingress>,
    status_controller: ResourceController<Service>,
    reconciler: Arc<IngressReconciler>,
    resync_period: Duration,
}

#[derive(Clone)]
struct SyncOnEvent {
    reconciler: Arc<IngressReconciler>,
}

#[async_trait::async_trait]
impl EventHandler<Ingress> for SyncOnEvent {
    async fn handle(&self, _object: &Ingress) -> anyhow::Result<()> {
        // passes recompute from the full ingress list, the triggering
        // object is only a change signal
        self.reconciler.sync().await.map_err(Into::into)
    }
}

#[derive(Clone)]
struct PropagateStatus {
    syncer: Arc<StatusSyncer>,
    service_name: String,
    service_namespace: String,
}

#[async_trait::async_trait]
impl EventHandler<Service> for PropagateStatus {
    async fn handle(&self, service: &Service) -> anyhow::Result<()> {
        // only the gateway proxy service carries the address we publish
        if service.name_any() != self.service_name
            || service.namespace().as_deref() != Some(self.service_namespace.as_str())
        {
            return Ok(());
        }
        self.syncer.propagate(service).await
    }
}

impl IngressController {
    pub fn new(
        ingresses: Api<Ingress>,
        proxy_services: Api<Service>,
        proxy_service_name: String,
        proxy_service_namespace: String,
        reconciler: IngressReconciler,
        status_syncer: StatusSyncer,
        resync_period: Duration,
    ) -> Self {
        let reconciler = Arc::new(reconciler);
        let status_syncer = Arc::new(status_syncer);

        let mut ingress_controller = ResourceController::new();
        ingress_controller.add_source(Box::new(KubeSource::new(ingresses, "ingresses")));
        let handler = SyncOnEvent {
            reconciler: Arc::clone(&reconciler),
        };
        ingress_controller.on_added(handler.clone());
        ingress_controller.on_updated(handler.clone());
        ingress_controller.on_deleted(handler);

        let mut status_controller = ResourceController::new();
        status_controller.add_source(Box::new(KubeSource::new(proxy_services, "proxy-service")));
        let status_handler = PropagateStatus {
            syncer: status_syncer,
            service_name: proxy_service_name,
            service_namespace: proxy_service_namespace,
        };
        status_controller.on_added(status_handler.clone());
        status_controller.on_updated(status_handler);

        Self {
            ingress_controller,
            status_controller,
            reconciler,
            resync_period,
        }
    }

    /// Error stream of the ingress reconcile path.
    pub fn take_errors(&mut self) -> Option<mpsc::UnboundedReceiver<ControllerError>> {
        self.ingress_controller.take_errors()
    }

    /// Error stream of the status propagation path.
    pub fn take_status_errors(&mut self) -> Option<mpsc::UnboundedReceiver<ControllerError>> {
        self.status_controller.take_errors()
    }

    /// Runs both event paths and the periodic resync until `stop`.
    pub async fn run(
        self,
        workers: usize,
        stop: watch::Receiver<bool>,
    ) -> Result<(), ControllerError> {
        let resync = tokio::spawn(resync_loop(
            Arc::clone(&self.reconciler),
            self.resync_period,
            self.ingress_controller.error_sender(),
            stop.clone(),
        ));

        let status = tokio::spawn(self.status_controller.run(1, stop.clone()));
        let result = self.ingress_controller.run(workers, stop).await;

        match status.await {
            Ok(status_result) => status_result?,
            Err(err) => error!(%err, "status controller panicked"),
        }
        let _ = resync.await;
        result
    }
}

async fn resync_loop(
    reconciler: Arc<IngressReconciler>,
    period: Duration,
    errors: mpsc::UnboundedSender<ControllerError>,
    mut stop: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the immediate first tick; startup state arrives through the watch
    interval.tick().await;

    info!("resync every {period:?}");
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(err) = reconciler.sync().await {
                    error!(%err, "resync pass failed");
                    let _ = errors.send(ControllerError::Resync(err.into()));
                }
            }
            _ = stop.changed() => break,
        }
    }
}
