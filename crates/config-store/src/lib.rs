//! Config object storage
//!
//! One CRUD+watch contract over three persistence substrates: a local file
//! tree, Consul KV, and Kubernetes custom resources. Every backend exposes
//! the same [`ObjectClient`] per object kind; watches deliver the entire
//! current collection to registered handlers whenever the backend's view
//! changes (natively on Kubernetes, via [`poll::PollWatcher`] elsewhere).

pub mod consul;
pub mod error;
pub mod file;
pub mod kube;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod poll;
pub mod sync;

pub use error::StorageError;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MemoryClient, RecordedOp};
pub use sync::{ReconcileError, converge, list_owned};

use config_api::{Upstream, VirtualHost};
use k8s_openapi::NamespaceResourceScope;
use ::kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// An object the storage backends know how to persist.
///
/// Identity and versioning ride in the standard `ObjectMeta`; `spec_eq` is
/// the structural comparison the reconcilers diff with (metadata excluded).
pub trait StorableObject:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + PartialEq
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Structural equality of everything except object metadata.
    fn spec_eq(&self, other: &Self) -> bool;
}

impl StorableObject for Upstream {
    fn spec_eq(&self, other: &Self) -> bool {
        self.spec == other.spec
    }
}

impl StorableObject for VirtualHost {
    fn spec_eq(&self, other: &Self) -> bool {
        self.spec == other.spec
    }
}

/// Receives the full current collection whenever a watched backend changes.
pub trait CollectionHandler<T>: Send + Sync {
    fn on_update(&self, objects: Vec<T>);
}

/// A long-running notification loop returned by [`ObjectClient::watch`].
///
/// Fetch errors are reported on `errors` and do not stop the loop; the loop
/// terminates on the stop signal or once the error receiver is gone.
#[async_trait::async_trait]
pub trait Watch: Send {
    async fn run(
        self: Box<Self>,
        stop: watch::Receiver<bool>,
        errors: mpsc::Sender<StorageError>,
    );
}

/// CRUD + watch for one object kind on one backend.
#[async_trait::async_trait]
pub trait ObjectClient<T: StorableObject>: Send + Sync {
    /// Fails with `AlreadyExists` if the name is taken; returns the stored
    /// copy with its backend-assigned resource version.
    async fn create(&self, obj: &T) -> Result<T, StorageError>;

    /// Fails with `NotFound` if the name is missing and with `Conflict` if
    /// the stored version moved since the caller read the object.
    async fn update(&self, obj: &T) -> Result<T, StorageError>;

    /// Deleting a missing name propagates the backend's not-found error.
    async fn delete(&self, name: &str) -> Result<(), StorageError>;

    async fn get(&self, name: &str) -> Result<T, StorageError>;

    async fn list(&self) -> Result<Vec<T>, StorageError>;

    /// Returns a watcher delivering the full collection to every handler on
    /// each observed change.
    async fn watch(
        &self,
        handlers: Vec<Arc<dyn CollectionHandler<T>>>,
    ) -> Result<Box<dyn Watch>, StorageError>;
}
