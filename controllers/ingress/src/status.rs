//! Ingress status propagation.
//!
//! Copies the gateway proxy Service's load-balancer address onto the status
//! of every ingress this controller serves, so `kubectl get ingress` shows
//! where traffic actually enters. A cache of the last written value
//! suppresses redundant status patches; a failed patch for one ingress
//! never blocks the rest of the pass.

use crate::reconciler::is_our_ingress;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{
    Ingress, IngressLoadBalancerIngress, IngressLoadBalancerStatus,
};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, error, info};

/// Read/patch access to ingress statuses.
#[async_trait::async_trait]
pub trait IngressStatusClient: Send + Sync {
    async fn list(&self) -> anyhow::Result<Vec<Ingress>>;

    async fn patch_load_balancer(
        &self,
        namespace: &str,
        name: &str,
        status: &IngressLoadBalancerStatus,
    ) -> anyhow::Result<()>;
}

/// Status client backed by the Kubernetes API.
pub struct KubeIngressStatusClient {
    client: Client,
}

impl KubeIngressStatusClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl IngressStatusClient for KubeIngressStatusClient {
    async fn list(&self) -> anyhow::Result<Vec<Ingress>> {
        let api: Api<Ingress> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_load_balancer(
        &self,
        namespace: &str,
        name: &str,
        status: &IngressLoadBalancerStatus,
    ) -> anyhow::Result<()> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "status": {
                "loadBalancer": status,
            }
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Propagates the proxy Service's load-balancer status onto ingresses.
pub struct StatusSyncer {
    ingresses: Box<dyn IngressStatusClient>,
    use_as_global_ingress: bool,
    ingress_class: String,
    // last value written per ingress, read-mostly
    cache: RwLock<HashMap<String, IngressLoadBalancerStatus>>,
}

impl StatusSyncer {
    pub fn new(
        ingresses: Box<dyn IngressStatusClient>,
        use_as_global_ingress: bool,
        ingress_class: String,
    ) -> Self {
        Self {
            ingresses,
            use_as_global_ingress,
            ingress_class,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// One propagation pass for the current proxy service state.
    pub async fn propagate(&self, service: &Service) -> anyhow::Result<()> {
        let lb = load_balancer_status(service);
        let ingresses = self.ingresses.list().await?;

        for ingress in &ingresses {
            if !is_our_ingress(self.use_as_global_ingress, &self.ingress_class, ingress) {
                continue;
            }
            let Some(namespace) = ingress.meta().namespace.clone() else {
                continue;
            };
            let name = ingress.name_any();
            let key = format!("{namespace}/{name}");

            let unchanged = self
                .cache
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&key)
                .is_some_and(|last| *last == lb);
            if unchanged {
                debug!(key, "load balancer status unchanged, skipping");
                continue;
            }

            match self
                .ingresses
                .patch_load_balancer(&namespace, &name, &lb)
                .await
            {
                Ok(()) => {
                    info!(key, "updated ingress load balancer status");
                    self.cache
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(key, lb.clone());
                }
                // keep going, the next pass retries this one
                Err(err) => error!(key, %err, "failed to patch ingress status"),
            }
        }
        Ok(())
    }
}

/// Converts the service's load-balancer status into the ingress form.
fn load_balancer_status(service: &Service) -> IngressLoadBalancerStatus {
    let entries = service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();

    IngressLoadBalancerStatus {
        ingress: Some(
            entries
                .iter()
                .map(|entry| IngressLoadBalancerIngress {
                    hostname: entry.hostname.clone(),
                    ip: entry.ip.clone(),
                    ports: None,
                })
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::INGRESS_CLASS;
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeStatusClient {
        ingresses: Vec<Ingress>,
        patches: Arc<Mutex<Vec<(String, IngressLoadBalancerStatus)>>>,
        fail_for: Arc<Mutex<Option<String>>>,
    }

    #[async_trait::async_trait]
    impl IngressStatusClient for FakeStatusClient {
        async fn list(&self) -> anyhow::Result<Vec<Ingress>> {
            Ok(self.ingresses.clone())
        }

        async fn patch_load_balancer(
            &self,
            namespace: &str,
            name: &str,
            status: &IngressLoadBalancerStatus,
        ) -> anyhow::Result<()> {
            let key = format!("{namespace}/{name}");
            if self.fail_for.lock().unwrap().as_deref() == Some(key.as_str()) {
                anyhow::bail!("patch refused");
            }
            self.patches.lock().unwrap().push((key, status.clone()));
            Ok(())
        }
    }

    fn ingress(name: &str) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(BTreeMap::from([(
                    "kubernetes.io/ingress.class".to_string(),
                    INGRESS_CLASS.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn proxy_service(ip: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("gateway-proxy".to_string()),
                namespace: Some("gateway-system".to_string()),
                ..Default::default()
            },
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some(ip.to_string()),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn syncer(client: FakeStatusClient) -> StatusSyncer {
        StatusSyncer::new(Box::new(client), false, INGRESS_CLASS.to_string())
    }

    #[tokio::test]
    async fn copies_the_service_address_onto_owned_ingresses() {
        let patches = Arc::new(Mutex::new(Vec::new()));
        let sync = syncer(FakeStatusClient {
            ingresses: vec![ingress("rusty")],
            patches: Arc::clone(&patches),
            fail_for: Arc::new(Mutex::new(None)),
        });

        sync.propagate(&proxy_service("10.0.0.1")).await.unwrap();

        let patches = patches.lock().unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].0, "default/rusty");
        let entries = patches[0].1.ingress.as_ref().unwrap();
        assert_eq!(entries[0].ip.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn unchanged_status_is_written_exactly_once() {
        let patches = Arc::new(Mutex::new(Vec::new()));
        let sync = syncer(FakeStatusClient {
            ingresses: vec![ingress("rusty")],
            patches: Arc::clone(&patches),
            fail_for: Arc::new(Mutex::new(None)),
        });

        let service = proxy_service("10.0.0.1");
        sync.propagate(&service).await.unwrap();
        sync.propagate(&service).await.unwrap();
        assert_eq!(patches.lock().unwrap().len(), 1);

        // a new address writes again
        sync.propagate(&proxy_service("10.0.0.2")).await.unwrap();
        assert_eq!(patches.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn one_failed_patch_does_not_block_the_rest() {
        let patches = Arc::new(Mutex::new(Vec::new()));
        let sync = syncer(FakeStatusClient {
            ingresses: vec![ingress("broken"), ingress("healthy")],
            patches: Arc::clone(&patches),
            fail_for: Arc::new(Mutex::new(Some("default/broken".to_string()))),
        });

        sync.propagate(&proxy_service("10.0.0.1")).await.unwrap();

        let patches = patches.lock().unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].0, "default/healthy");
    }

    #[tokio::test]
    async fn failed_patches_are_retried_on_the_next_pass() {
        let patches = Arc::new(Mutex::new(Vec::new()));
        let fail_for = Arc::new(Mutex::new(Some("default/rusty".to_string())));
        let sync = syncer(FakeStatusClient {
            ingresses: vec![ingress("rusty")],
            patches: Arc::clone(&patches),
            fail_for: Arc::clone(&fail_for),
        });

        let service = proxy_service("10.0.0.1");
        sync.propagate(&service).await.unwrap();
        // nothing cached for the failed ingress...
        assert!(patches.lock().unwrap().is_empty());

        // ...so an identical pass writes it once the API recovers
        *fail_for.lock().unwrap() = None;
        sync.propagate(&service).await.unwrap();
        assert_eq!(patches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn foreign_ingresses_are_not_touched() {
        let patches = Arc::new(Mutex::new(Vec::new()));
        let mut foreign = ingress("foreign");
        foreign.metadata.annotations = Some(BTreeMap::from([(
            "kubernetes.io/ingress.class".to_string(),
            "nginx".to_string(),
        )]));
        let sync = syncer(FakeStatusClient {
            ingresses: vec![foreign],
            patches: Arc::clone(&patches),
            fail_for: Arc::new(Mutex::new(None)),
        });

        sync.propagate(&proxy_service("10.0.0.1")).await.unwrap();
        assert!(patches.lock().unwrap().is_empty());
    }
}
