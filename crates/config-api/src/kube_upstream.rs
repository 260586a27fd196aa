//! Kubernetes upstream payload
//!
//! The well-known payload both reconcilers generate: one upstream per
//! Kubernetes service port. Names are a deterministic function of
//! (namespace, service, port) so repeated reconciliation passes over
//! unchanged platform state produce byte-identical objects.

use crate::upstream::{Upstream, UpstreamSpec};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type tag for upstreams backed by a Kubernetes service.
pub const UPSTREAM_TYPE_KUBE: &str = "kubernetes";

/// A service port referenced either by number or by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum PortSelector {
    Number(i32),
    Name(String),
}

impl fmt::Display for PortSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSelector::Number(n) => write!(f, "{n}"),
            PortSelector::Name(name) => f.write_str(name),
        }
    }
}

/// Configuration payload carried inside a kubernetes-type upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeUpstreamConfig {
    pub service_name: String,
    pub service_namespace: String,
    pub service_port: PortSelector,
}

impl KubeUpstreamConfig {
    /// Deterministic upstream name for this service port.
    pub fn upstream_name(&self) -> String {
        format!(
            "{}-{}-{}",
            self.service_namespace, self.service_name, self.service_port
        )
    }

    /// Builds the full Upstream object (ownership annotations are the
    /// caller's concern).
    pub fn into_upstream(self) -> Upstream {
        let name = self.upstream_name();
        let config = serde_json::json!({
            "serviceName": self.service_name,
            "serviceNamespace": self.service_namespace,
            "servicePort": self.service_port,
        });
        Upstream::new(
            &name,
            UpstreamSpec {
                upstream_type: UPSTREAM_TYPE_KUBE.to_string(),
                config,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::ResourceExt;

    #[test]
    fn names_are_deterministic() {
        let config = KubeUpstreamConfig {
            service_name: "petstore".to_string(),
            service_namespace: "default".to_string(),
            service_port: PortSelector::Number(8080),
        };
        assert_eq!(config.upstream_name(), "default-petstore-8080");
        assert_eq!(config.clone().into_upstream(), config.into_upstream());
    }

    #[test]
    fn named_ports_use_the_name() {
        let config = KubeUpstreamConfig {
            service_name: "petstore".to_string(),
            service_namespace: "default".to_string(),
            service_port: PortSelector::Name("http".to_string()),
        };
        assert_eq!(config.upstream_name(), "default-petstore-http");
    }

    #[test]
    fn upstream_carries_tagged_payload() {
        let us = KubeUpstreamConfig {
            service_name: "petstore".to_string(),
            service_namespace: "default".to_string(),
            service_port: PortSelector::Number(8080),
        }
        .into_upstream();

        assert_eq!(us.name_any(), "default-petstore-8080");
        assert_eq!(us.spec.upstream_type, UPSTREAM_TYPE_KUBE);
        assert_eq!(us.spec.config["serviceName"], "petstore");
        assert_eq!(us.spec.config["servicePort"], 8080);
    }
}
