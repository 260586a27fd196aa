//! Kubernetes storage backend.
//!
//! Stores objects as namespaced custom resources and leans on the API
//! server for everything the other backends emulate: optimistic concurrency
//! via `resourceVersion`, native list/watch, and uniqueness on create.

use crate::{CollectionHandler, ObjectClient, StorableObject, StorageError, Watch};
use config_api::{Upstream, VirtualHost};
use futures::TryStreamExt;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use kube_runtime::WatchStreamExt;
use kube_runtime::watcher::{self, watcher};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// CRD-backed storage scoped to one namespace.
#[derive(Clone)]
pub struct KubeStorage {
    client: Client,
    namespace: String,
}

impl KubeStorage {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn upstreams(&self) -> KubeObjectClient<Upstream> {
        KubeObjectClient {
            api: Api::namespaced(self.client.clone(), &self.namespace),
        }
    }

    pub fn virtual_hosts(&self) -> KubeObjectClient<VirtualHost> {
        KubeObjectClient {
            api: Api::namespaced(self.client.clone(), &self.namespace),
        }
    }
}

/// Kubernetes-backed client for one object kind.
#[derive(Clone)]
pub struct KubeObjectClient<T> {
    api: Api<T>,
}

fn map_kube_err<T: StorableObject>(
    op: &'static str,
    name: &str,
    err: kube::Error,
) -> StorageError {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => StorageError::not_found::<T>(name),
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            StorageError::already_exists::<T>(name)
        }
        kube::Error::Api(resp) if resp.code == 409 => StorageError::conflict::<T>(name),
        _ => StorageError::Kube {
            op,
            name: name.to_string(),
            source: err,
        },
    }
}

#[async_trait::async_trait]
impl<T: StorableObject> ObjectClient<T> for KubeObjectClient<T> {
    async fn create(&self, obj: &T) -> Result<T, StorageError> {
        let name = obj.name_any();
        debug!(name, "creating custom resource");
        self.api
            .create(&PostParams::default(), obj)
            .await
            .map_err(|err| map_kube_err::<T>("create", &name, err))
    }

    async fn update(&self, obj: &T) -> Result<T, StorageError> {
        let name = obj.name_any();
        debug!(name, "replacing custom resource");
        self.api
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|err| map_kube_err::<T>("replace", &name, err))
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        debug!(name, "deleting custom resource");
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|err| map_kube_err::<T>("delete", name, err))
    }

    async fn get(&self, name: &str) -> Result<T, StorageError> {
        self.api
            .get(name)
            .await
            .map_err(|err| map_kube_err::<T>("get", name, err))
    }

    async fn list(&self) -> Result<Vec<T>, StorageError> {
        self.api
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|err| map_kube_err::<T>("list", "*", err))
    }

    async fn watch(
        &self,
        handlers: Vec<Arc<dyn CollectionHandler<T>>>,
    ) -> Result<Box<dyn Watch>, StorageError> {
        Ok(Box::new(KubeWatch {
            api: self.api.clone(),
            handlers,
        }))
    }
}

/// Native watch: each change signal triggers a re-list so handlers always
/// receive the full current collection, matching the polled backends.
pub struct KubeWatch<T> {
    api: Api<T>,
    handlers: Vec<Arc<dyn CollectionHandler<T>>>,
}

impl<T: StorableObject> KubeWatch<T> {
    async fn notify(&self, errors: &mpsc::Sender<StorageError>) -> bool {
        match self.api.list(&ListParams::default()).await {
            Ok(list) => {
                for handler in &self.handlers {
                    handler.on_update(list.items.clone());
                }
                true
            }
            Err(err) => {
                let err = map_kube_err::<T>("list", "*", err);
                warn!(%err, "failed to re-list after change");
                errors.send(err).await.is_ok()
            }
        }
    }
}

#[async_trait::async_trait]
impl<T: StorableObject> Watch for KubeWatch<T> {
    async fn run(
        self: Box<Self>,
        mut stop: watch::Receiver<bool>,
        errors: mpsc::Sender<StorageError>,
    ) {
        let stream = watcher(self.api.clone(), watcher::Config::default()).default_backoff();
        tokio::pin!(stream);
        let mut synced = false;

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                event = stream.try_next() => match event {
                    Ok(Some(watcher::Event::InitDone)) => {
                        synced = true;
                        if !self.notify(&errors).await {
                            break;
                        }
                    }
                    Ok(Some(watcher::Event::Apply(_) | watcher::Event::Delete(_))) if synced => {
                        if !self.notify(&errors).await {
                            break;
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(err) => {
                        warn!(%err, "watch stream error");
                        if errors
                            .send(StorageError::Watch(err.to_string()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                },
            }
        }
    }
}
