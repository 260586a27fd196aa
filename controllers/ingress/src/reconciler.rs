//! Ingress reconciliation.
//!
//! Translates the cluster's ingress rules into desired Upstreams and
//! VirtualHosts and converges the storage backend onto them. One virtual
//! host per distinct rule host, plus a catch-all "default" host (domain
//! `*`) for default-backend and host-less rules. Ingresses are processed
//! in name order so the diff never depends on platform listing order.

use config_api::{
    Destination, KubeUpstreamConfig, PathMatcher, PortSelector, Route, SslConfig, Upstream,
    VirtualHost, VirtualHostSpec, mark_generated_by, sort_routes,
};
use config_store::{ObjectClient, ReconcileError, converge, list_owned};
use k8s_openapi::api::networking::v1::{Ingress, IngressBackend};
use kube::api::ListParams;
use kube::{Api, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Name (and implicit host) of the catch-all virtual host.
const DEFAULT_VIRTUAL_HOST: &str = "default";

/// Ingress class handled when not running as the global ingress.
pub const INGRESS_CLASS: &str = "gateway";

const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Read access to the platform's ingress collection.
#[async_trait::async_trait]
pub trait IngressLister: Send + Sync {
    async fn list(&self) -> anyhow::Result<Vec<Ingress>>;
}

/// Lister backed by the Kubernetes API.
pub struct KubeIngressLister {
    api: Api<Ingress>,
}

impl KubeIngressLister {
    pub fn new(api: Api<Ingress>) -> Self {
        Self { api }
    }
}

#[async_trait::async_trait]
impl IngressLister for KubeIngressLister {
    async fn list(&self) -> anyhow::Result<Vec<Ingress>> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }
}

/// Whether this controller is responsible for `ingress`.
pub fn is_our_ingress(use_as_global_ingress: bool, class: &str, ingress: &Ingress) -> bool {
    if use_as_global_ingress {
        return true;
    }
    let by_annotation = ingress
        .annotations()
        .get(INGRESS_CLASS_ANNOTATION)
        .is_some_and(|v| v == class);
    let by_field = ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.ingress_class_name.as_deref())
        .is_some_and(|v| v == class);
    by_annotation || by_field
}

/// Converges ingress rules into owned Upstreams and VirtualHosts.
pub struct IngressReconciler {
    lister: Arc<dyn IngressLister>,
    upstreams: Arc<dyn ObjectClient<Upstream>>,
    virtual_hosts: Arc<dyn ObjectClient<VirtualHost>>,
    use_as_global_ingress: bool,
    ingress_class: String,
    generated_by: String,
}

impl IngressReconciler {
    pub fn new(
        lister: Arc<dyn IngressLister>,
        upstreams: Arc<dyn ObjectClient<Upstream>>,
        virtual_hosts: Arc<dyn ObjectClient<VirtualHost>>,
        use_as_global_ingress: bool,
        ingress_class: String,
        generated_by: String,
    ) -> Self {
        Self {
            lister,
            upstreams,
            virtual_hosts,
            use_as_global_ingress,
            ingress_class,
            generated_by,
        }
    }

    /// One full reconciliation pass.
    pub async fn sync(&self) -> Result<(), ReconcileError> {
        let (desired_upstreams, desired_virtual_hosts) = self.desired_resources().await?;
        debug!(
            upstreams = desired_upstreams.len(),
            virtual_hosts = desired_virtual_hosts.len(),
            "computed desired state"
        );

        // upstreams first so no virtual host ever points at a missing one;
        // creation tolerates the service controller racing on shared names
        let actual = list_owned(self.upstreams.as_ref(), &self.generated_by).await?;
        converge(desired_upstreams, actual, self.upstreams.as_ref(), true).await?;

        let actual = list_owned(self.virtual_hosts.as_ref(), &self.generated_by).await?;
        converge(
            desired_virtual_hosts,
            actual,
            self.virtual_hosts.as_ref(),
            false,
        )
        .await
    }

    async fn desired_resources(&self) -> Result<(Vec<Upstream>, Vec<VirtualHost>), ReconcileError> {
        let mut ingresses = self.lister.list().await.map_err(ReconcileError::Platform)?;
        // stable input order: the diff must not depend on listing order
        ingresses.sort_by_key(|ing| ing.name_any());

        let mut upstreams: BTreeMap<String, Upstream> = BTreeMap::new();
        let mut routes_by_host: BTreeMap<String, Vec<Route>> = BTreeMap::new();
        let mut ssl_by_host: BTreeMap<String, SslConfig> = BTreeMap::new();
        let mut have_default_backend = false;

        for ingress in &ingresses {
            if !is_our_ingress(self.use_as_global_ingress, &self.ingress_class, ingress) {
                continue;
            }
            let Some(namespace) = ingress.meta().namespace.clone() else {
                continue;
            };
            let Some(spec) = &ingress.spec else { continue };

            for tls in spec.tls.iter().flatten() {
                let Some(secret) = &tls.secret_name else {
                    continue;
                };
                let ssl = SslConfig {
                    secret_ref: secret.clone(),
                };
                match &tls.hosts {
                    Some(hosts) if !hosts.is_empty() => {
                        for host in hosts {
                            ssl_by_host.insert(host.clone(), ssl.clone());
                        }
                    }
                    // a hostless TLS section covers the catch-all host
                    _ => {
                        ssl_by_host.insert(DEFAULT_VIRTUAL_HOST.to_string(), ssl.clone());
                    }
                }
            }

            if let Some(backend) = &spec.default_backend {
                match upstream_for_backend(&namespace, backend) {
                    Some(upstream) if have_default_backend => {
                        warn!(
                            ingress = %ingress.name_any(),
                            upstream = %upstream.name_any(),
                            "default backend redefined, ignoring"
                        );
                    }
                    Some(upstream) => {
                        have_default_backend = true;
                        routes_by_host
                            .entry(DEFAULT_VIRTUAL_HOST.to_string())
                            .or_default()
                            .push(Route {
                                matcher: PathMatcher::Prefix("/".to_string()),
                                destination: Destination {
                                    upstream: upstream.name_any(),
                                },
                            });
                        self.add_upstream(&mut upstreams, upstream);
                    }
                    None => {}
                }
            }

            for rule in spec.rules.iter().flatten() {
                let host = match rule.host.as_deref() {
                    Some(host) if !host.is_empty() => host.to_string(),
                    _ => DEFAULT_VIRTUAL_HOST.to_string(),
                };
                let Some(http) = &rule.http else { continue };
                for path in &http.paths {
                    let Some(upstream) = upstream_for_backend(&namespace, &path.backend) else {
                        continue;
                    };
                    routes_by_host.entry(host.clone()).or_default().push(Route {
                        matcher: matcher_for_path(path.path.as_deref(), &path.path_type),
                        destination: Destination {
                            upstream: upstream.name_any(),
                        },
                    });
                    self.add_upstream(&mut upstreams, upstream);
                }
            }
        }

        let mut virtual_hosts = Vec::with_capacity(routes_by_host.len());
        for (host, mut routes) in routes_by_host {
            // proxy matching is first-match-wins
            sort_routes(&mut routes);
            let domains = if host == DEFAULT_VIRTUAL_HOST {
                vec!["*".to_string()]
            } else {
                vec![host.clone()]
            };
            let mut virtual_host = VirtualHost::new(
                &host,
                VirtualHostSpec {
                    domains,
                    routes,
                    ssl_config: ssl_by_host.get(&host).cloned(),
                },
            );
            mark_generated_by(virtual_host.meta_mut(), &self.generated_by);
            virtual_hosts.push(virtual_host);
        }

        Ok((upstreams.into_values().collect(), virtual_hosts))
    }

    fn add_upstream(&self, upstreams: &mut BTreeMap<String, Upstream>, mut upstream: Upstream) {
        mark_generated_by(upstream.meta_mut(), &self.generated_by);
        upstreams.insert(upstream.name_any(), upstream);
    }
}

fn upstream_for_backend(namespace: &str, backend: &IngressBackend) -> Option<Upstream> {
    let service = backend.service.as_ref()?;
    let port = service.port.as_ref()?;
    let service_port = match (port.number, &port.name) {
        (Some(number), _) => PortSelector::Number(number),
        (None, Some(name)) => PortSelector::Name(name.clone()),
        (None, None) => return None,
    };
    Some(
        KubeUpstreamConfig {
            service_name: service.name.clone(),
            service_namespace: namespace.to_string(),
            service_port,
        }
        .into_upstream(),
    )
}

fn matcher_for_path(path: Option<&str>, path_type: &str) -> PathMatcher {
    let path = match path {
        Some(path) if !path.is_empty() => path.to_string(),
        _ => "/".to_string(),
    };
    match path_type {
        "Exact" => PathMatcher::Exact(path),
        "Prefix" => PathMatcher::Prefix(path),
        // ImplementationSpecific paths are treated as regexes, matching the
        // proxy's ingress-compatible behavior
        _ => PathMatcher::Regex(path),
    }
}
