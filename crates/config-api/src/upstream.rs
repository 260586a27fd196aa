//! Upstream CRD
//!
//! A named, routable destination. The `config` payload is type-tagged and
//! opaque: the reconciliation core only ever compares it structurally, the
//! translation layer downstream is the sole interpreter.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gateway.microscaler.io",
    version = "v1alpha1",
    kind = "Upstream",
    plural = "upstreams",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSpec {
    /// Upstream type tag (e.g. "kubernetes", "static"), names the plugin
    /// that understands `config`
    #[serde(rename = "type")]
    pub upstream_type: String,

    /// Opaque configuration payload for the tagged type
    #[serde(default)]
    pub config: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_equality_is_structural() {
        let a = UpstreamSpec {
            upstream_type: "kubernetes".to_string(),
            config: serde_json::json!({"serviceName": "foo", "servicePort": 80}),
        };
        let b = UpstreamSpec {
            upstream_type: "kubernetes".to_string(),
            config: serde_json::json!({"servicePort": 80, "serviceName": "foo"}),
        };
        // key order does not matter
        assert_eq!(a, b);

        let c = UpstreamSpec {
            config: serde_json::json!({"serviceName": "foo", "servicePort": 81}),
            ..a.clone()
        };
        assert_ne!(a, c);
    }

    #[test]
    fn serializes_with_type_tag() {
        let spec = UpstreamSpec {
            upstream_type: "static".to_string(),
            config: serde_json::json!({"hosts": ["10.0.0.1:8080"]}),
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["type"], "static");
        assert_eq!(value["config"]["hosts"][0], "10.0.0.1:8080");
    }
}
