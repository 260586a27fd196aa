//! Service discovery reconciliation.
//!
//! Desired state is one Upstream per (service, port) across the watched
//! namespaces, excluding the cluster's own system namespace. Upstream
//! creation tolerates AlreadyExists: the ingress controller generates
//! identically-named upstreams for backends it routes to, and both owners
//! converge on the same object.

use config_api::{KubeUpstreamConfig, PortSelector, Upstream, mark_generated_by};
use config_store::{ObjectClient, ReconcileError, converge, list_owned};
use k8s_openapi::api::core::v1::Service;
use kube::api::ListParams;
use kube::{Api, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Namespace whose services are never turned into upstreams.
const SYSTEM_NAMESPACE: &str = "kube-system";

/// Read access to the platform's service collection.
#[async_trait::async_trait]
pub trait ServiceLister: Send + Sync {
    async fn list(&self) -> anyhow::Result<Vec<Service>>;
}

/// Lister backed by the Kubernetes API.
pub struct KubeServiceLister {
    api: Api<Service>,
}

impl KubeServiceLister {
    pub fn new(api: Api<Service>) -> Self {
        Self { api }
    }
}

#[async_trait::async_trait]
impl ServiceLister for KubeServiceLister {
    async fn list(&self) -> anyhow::Result<Vec<Service>> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }
}

/// Converges discovered services into owned upstreams.
pub struct ServiceReconciler {
    lister: Arc<dyn ServiceLister>,
    upstreams: Arc<dyn ObjectClient<Upstream>>,
    generated_by: String,
}

impl ServiceReconciler {
    pub fn new(
        lister: Arc<dyn ServiceLister>,
        upstreams: Arc<dyn ObjectClient<Upstream>>,
        generated_by: String,
    ) -> Self {
        Self {
            lister,
            upstreams,
            generated_by,
        }
    }

    /// One full reconciliation pass.
    pub async fn sync(&self) -> Result<(), ReconcileError> {
        let desired = self.desired_upstreams().await?;
        debug!(desired = desired.len(), "computed desired upstreams");
        let actual = list_owned(self.upstreams.as_ref(), &self.generated_by).await?;
        converge(desired, actual, self.upstreams.as_ref(), true).await
    }

    async fn desired_upstreams(&self) -> Result<Vec<Upstream>, ReconcileError> {
        let services = self.lister.list().await.map_err(ReconcileError::Platform)?;

        // keyed by name: deterministic output order, duplicates collapse
        let mut upstreams: BTreeMap<String, Upstream> = BTreeMap::new();
        for service in &services {
            let Some(namespace) = service.meta().namespace.clone() else {
                continue;
            };
            if namespace == SYSTEM_NAMESPACE {
                continue;
            }
            let ports = service
                .spec
                .as_ref()
                .and_then(|spec| spec.ports.as_ref())
                .map(Vec::as_slice)
                .unwrap_or_default();
            for port in ports {
                let mut upstream = KubeUpstreamConfig {
                    service_name: service.name_any(),
                    service_namespace: namespace.clone(),
                    service_port: PortSelector::Number(port.port),
                }
                .into_upstream();
                mark_generated_by(upstream.meta_mut(), &self.generated_by);
                upstreams.insert(upstream.name_any(), upstream);
            }
        }
        Ok(upstreams.into_values().collect())
    }
}
