//! VirtualHost CRD
//!
//! A set of routes served for a group of domains. Route order inside a
//! virtual host is significant: the proxy matches first-match-wins, so
//! routes must be kept longest-path-first (see [`sort_routes`]).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gateway.microscaler.io",
    version = "v1alpha1",
    kind = "VirtualHost",
    plural = "virtualhosts",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualHostSpec {
    /// Domains this virtual host serves ("*" matches any host)
    pub domains: Vec<String>,

    /// Routes in matching order (longest path first)
    #[serde(default)]
    pub routes: Vec<Route>,

    /// TLS configuration for these domains
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_config: Option<SslConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Request path matcher
    pub matcher: PathMatcher,

    /// Where matching requests are sent
    pub destination: Destination,
}

/// Path portion of a route matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum PathMatcher {
    /// Matches any path beginning with the prefix
    Prefix(String),
    /// Matches the path exactly
    Exact(String),
    /// Matches the path against a regular expression
    Regex(String),
}

impl PathMatcher {
    /// The raw path string, regardless of match style.
    pub fn path(&self) -> &str {
        match self {
            PathMatcher::Prefix(p) | PathMatcher::Exact(p) | PathMatcher::Regex(p) => p,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Name of the Upstream receiving the traffic
    pub upstream: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SslConfig {
    /// Name of the secret holding the certificate and key
    pub secret_ref: String,
}

/// Sorts routes for first-match-wins proxies: longer matcher paths first,
/// equal lengths ordered lexicographically.
pub fn sort_routes(routes: &mut [Route]) {
    routes.sort_by(|a, b| {
        let p1 = a.matcher.path();
        let p2 = b.matcher.path();
        p2.len().cmp(&p1.len()).then_with(|| p1.cmp(p2))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str) -> Route {
        Route {
            matcher: PathMatcher::Prefix(path.to_string()),
            destination: Destination {
                upstream: "up".to_string(),
            },
        }
    }

    #[test]
    fn longest_path_first() {
        let mut routes = vec![route("/foo"), route("/foo/bar")];
        sort_routes(&mut routes);
        assert_eq!(routes[0].matcher.path(), "/foo/bar");
        assert_eq!(routes[1].matcher.path(), "/foo");
    }

    #[test]
    fn equal_length_sorts_lexicographically() {
        let mut routes = vec![route("/b"), route("/a")];
        sort_routes(&mut routes);
        assert_eq!(routes[0].matcher.path(), "/a");
        assert_eq!(routes[1].matcher.path(), "/b");
    }

    #[test]
    fn mixed_ordering() {
        let mut routes = vec![route("/"), route("/api/v2"), route("/api"), route("/api/v1")];
        sort_routes(&mut routes);
        let paths: Vec<&str> = routes.iter().map(|r| r.matcher.path()).collect();
        assert_eq!(paths, vec!["/api/v1", "/api/v2", "/api", "/"]);
    }

    #[test]
    fn matcher_serializes_tagged() {
        let m = PathMatcher::Prefix("/foo".to_string());
        let value = serde_json::to_value(&m).unwrap();
        assert_eq!(value, serde_json::json!({"prefix": "/foo"}));
    }
}
