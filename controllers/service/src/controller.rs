//! Controller wiring.
//!
//! Binds the Kubernetes service watch to the event queue and registers the
//! reconciler as the handler for every event kind; any service change
//! triggers a full sync pass. A periodic resync tick re-runs the pass even
//! without events, mirroring the event path's error reporting.

use crate::reconciler::{KubeServiceLister, ServiceReconciler};
use config_api::Upstream;
use config_store::ObjectClient;
use controller_core::{ControllerError, EventHandler, KubeSource, ResourceController};
use k8s_openapi::api::core::v1::Service;
use kube::Api;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

/// Keeps gateway upstreams converged with discovered services.
pub struct ServiceController {
    controller: ResourceController<Service>,
    reconciler: Arc<ServiceReconciler>,
    resync_period: Duration,
}

#[derive(Clone)]
struct SyncOnEvent {
    reconciler: Arc<ServiceReconciler>,
}

#[async_trait::async_trait]
impl EventHandler<Service> for SyncOnEvent {
    async fn handle(&self, _object: &Service) -> anyhow::Result<()> {
        // passes recompute from the full service list, the triggering
        // object is only a change signal
        self.reconciler.sync().await.map_err(Into::into)
    }
}

impl ServiceController {
    pub fn new(
        services: Api<Service>,
        upstreams: Arc<dyn ObjectClient<Upstream>>,
        generated_by: String,
        resync_period: Duration,
    ) -> Self {
        let lister = Arc::new(KubeServiceLister::new(services.clone()));
        let reconciler = Arc::new(ServiceReconciler::new(lister, upstreams, generated_by));

        let mut controller = ResourceController::new();
        controller.add_source(Box::new(KubeSource::new(services, "services")));
        let handler = SyncOnEvent {
            reconciler: Arc::clone(&reconciler),
        };
        controller.on_added(handler.clone());
        controller.on_updated(handler.clone());
        controller.on_deleted(handler);

        Self {
            controller,
            reconciler,
            resync_period,
        }
    }

    /// Error stream for the owning process to log.
    pub fn take_errors(&mut self) -> Option<mpsc::UnboundedReceiver<ControllerError>> {
        self.controller.take_errors()
    }

    /// Runs the watch, workers, and the periodic resync until `stop`.
    pub async fn run(
        self,
        workers: usize,
        stop: watch::Receiver<bool>,
    ) -> Result<(), ControllerError> {
        let resync = tokio::spawn(resync_loop(
            Arc::clone(&self.reconciler),
            self.resync_period,
            self.controller.error_sender(),
            stop.clone(),
        ));

        let result = self.controller.run(workers, stop).await;
        let _ = resync.await;
        result
    }
}

async fn resync_loop(
    reconciler: Arc<ServiceReconciler>,
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
