//! Gateway routing object definitions
//!
//! Custom resource types for the two routing objects managed by the control
//! plane: `Upstream` (a routable destination) and `VirtualHost` (a set of
//! routes served for a group of domains). The same types are serialized
//! as-is by the file and Consul storage backends, so these definitions are
//! the single source of truth for the on-wire object shape.

pub mod kube_upstream;
pub mod upstream;
pub mod virtual_host;

pub use kube_upstream::*;
pub use upstream::*;
pub use virtual_host::*;

use kube::api::ObjectMeta;

/// Annotation key marking which reconciler instance created an object.
///
/// Reconcilers only ever list, update, or delete objects that carry their
/// own identifier under this key. User-created objects never have it.
pub const GENERATED_BY_ANNOTATION: &str = "gateway.microscaler.io/generated-by";

/// Stamps the ownership annotation onto `meta`.
pub fn mark_generated_by(meta: &mut ObjectMeta, generated_by: &str) {
    meta.annotations
        .get_or_insert_with(Default::default)
        .insert(GENERATED_BY_ANNOTATION.to_string(), generated_by.to_string());
}

/// Returns the ownership identifier recorded on `meta`, if any.
pub fn generated_by(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(GENERATED_BY_ANNOTATION))
        .map(String::as_str)
}
