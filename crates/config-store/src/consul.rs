//! Consul KV storage backend.
//!
//! Objects are stored as JSON under `root/kind/name`. Consul's per-key
//! modify index doubles as the resource version: creates re-read the key to
//! capture the assigned index, and updates go through a check-and-set so a
//! concurrent writer surfaces as a named `Conflict` rather than a silent
//! overwrite or a generic transport error.

use crate::poll::{PollSource, PollWatcher};
use crate::{CollectionHandler, ObjectClient, StorableObject, StorageError, Watch};
use config_api::{Upstream, VirtualHost};
use consul_client::{ConsulError, ConsulKv, KvPair};
use kube::ResourceExt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Consul-backed storage rooted at a KV prefix.
pub struct ConsulStorage<C> {
    client: Arc<C>,
    root: String,
    sync_frequency: Duration,
}

impl<C: ConsulKv + 'static> ConsulStorage<C> {
    pub fn new(client: C, root: impl Into<String>, sync_frequency: Duration) -> Self {
        Self {
            client: Arc::new(client),
            root: root.into().trim_end_matches('/').to_string(),
            sync_frequency,
        }
    }

    pub fn upstreams(&self) -> ConsulObjectClient<Upstream, C> {
        ConsulObjectClient::new(Arc::clone(&self.client), &self.root, self.sync_frequency)
    }

    pub fn virtual_hosts(&self) -> ConsulObjectClient<VirtualHost, C> {
        ConsulObjectClient::new(Arc::clone(&self.client), &self.root, self.sync_frequency)
    }
}

/// Consul-backed client for one object kind.
pub struct ConsulObjectClient<T, C> {
    client: Arc<C>,
    prefix: String,
    sync_frequency: Duration,
    _kind: PhantomData<fn() -> T>,
}

impl<T, C> Clone for ConsulObjectClient<T, C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            prefix: self.prefix.clone(),
            sync_frequency: self.sync_frequency,
            _kind: PhantomData,
        }
    }
}

fn consul_err(op: &'static str, key: &str, source: ConsulError) -> StorageError {
    StorageError::Consul {
        op,
        key: key.to_string(),
        source,
    }
}

impl<T: StorableObject, C: ConsulKv + 'static> ConsulObjectClient<T, C> {
    fn new(client: Arc<C>, root: &str, sync_frequency: Duration) -> Self {
        Self {
            client,
            prefix: format!("{root}/{}", T::plural(&())),
            sync_frequency,
            _kind: PhantomData,
        }
    }

    fn key_for(&self, name: &str) -> String {
        format!("{}/{name}", self.prefix)
    }

    fn named(obj: &T) -> Result<String, StorageError> {
        let name = obj.name_any();
        if name.is_empty() {
            return Err(StorageError::MissingName);
        }
        Ok(name)
    }

    /// Serialized form written to the KV store. The resource version is
    /// owned by Consul (the modify index), so it never goes on the wire.
    fn encode(&self, obj: &T, key: &str) -> Result<Vec<u8>, StorageError> {
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = None;
        serde_json::to_vec(&stored).map_err(|source| StorageError::Json {
            key: key.to_string(),
            source,
        })
    }

    fn decode(&self, pair: &KvPair) -> Result<T, StorageError> {
        let mut obj: T =
            serde_json::from_slice(&pair.value).map_err(|source| StorageError::Json {
                key: pair.key.clone(),
                source,
            })?;
        obj.meta_mut().resource_version = Some(pair.modify_index.to_string());
        Ok(obj)
    }

    /// Re-reads a key after a write to pick up the assigned modify index.
    async fn read_back(&self, key: &str, name: &str) -> Result<T, StorageError> {
        let pair = self
            .client
            .get(key, true)
            .await
            .map_err(|e| consul_err("get", key, e))?
            .ok_or_else(|| StorageError::not_found::<T>(name))?;
        self.decode(&pair)
    }

    async fn list_with_index(&self) -> Result<(Vec<T>, u64), StorageError> {
        let listing = self
            .client
            .list(&self.prefix)
            .await
            .map_err(|e| consul_err("list", &self.prefix, e))?;
        let mut objects = Vec::with_capacity(listing.pairs.len());
        for pair in &listing.pairs {
            objects.push(self.decode(pair)?);
        }
        Ok((objects, listing.last_index))
    }
}

#[async_trait::async_trait]
impl<T: StorableObject, C: ConsulKv + 'static> ObjectClient<T> for ConsulObjectClient<T, C> {
    async fn create(&self, obj: &T) -> Result<T, StorageError> {
        let name = Self::named(obj)?;
        let key = self.key_for(&name);

        // consistent read so a create racing another writer is detected
        let existing = self
            .client
            .get(&key, true)
            .await
            .map_err(|e| consul_err("get", &key, e))?;
        if existing.is_some() {
            return Err(StorageError::already_exists::<T>(&name));
        }

        debug!(key, "creating consul key");
        let value = self.encode(obj, &key)?;
        self.client
            .put(&key, &value)
            .await
            .map_err(|e| consul_err("put", &key, e))?;

        self.read_back(&key, &name).await
    }

    async fn update(&self, obj: &T) -> Result<T, StorageError> {
        let name = Self::named(obj)?;
        let key = self.key_for(&name);

        let existing = self
            .client
            .get(&key, true)
            .await
            .map_err(|e| consul_err("get", &key, e))?;
        if existing.is_none() {
            return Err(StorageError::not_found::<T>(&name));
        }

        // the caller must present the resource version it read
        let index: u64 = obj
            .meta()
            .resource_version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| StorageError::conflict::<T>(&name))?;

        debug!(key, index, "updating consul key");
        let value = self.encode(obj, &key)?;
        let swapped = self
            .client
            .put_cas(&key, &value, index)
            .await
            .map_err(|e| consul_err("cas", &key, e))?;
        if !swapped {
            // lost the race, not a transport failure
            return Err(StorageError::conflict::<T>(&name));
        }

        self.read_back(&key, &name).await
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        let key = self.key_for(name);
        let existing = self
            .client
            .get(&key, true)
            .await
            .map_err(|e| consul_err("get", &key, e))?;
        if existing.is_none() {
            return Err(StorageError::not_found::<T>(name));
        }
        debug!(key, "deleting consul key");
        self.client
            .delete(&key)
            .await
            .map_err(|e| consul_err("delete", &key, e))
    }

    async fn get(&self, name: &str) -> Result<T, StorageError> {
        self.read_back(&self.key_for(name), name).await
    }

    async fn list(&self) -> Result<Vec<T>, StorageError> {
        Ok(self.list_with_index().await?.0)
    }

    async fn watch(
        &self,
        handlers: Vec<Arc<dyn CollectionHandler<T>>>,
    ) -> Result<Box<dyn Watch>, StorageError> {
        Ok(Box::new(PollWatcher::new(
            Box::new(self.clone()),
            self.sync_frequency,
            handlers,
        )))
    }
}

#[async_trait::async_trait]
impl<T: StorableObject, C: ConsulKv + 'static> PollSource<T> for ConsulObjectClient<T, C> {
    async fn poll(&self) -> Result<(Vec<T>, Option<u64>), StorageError> {
        let (objects, last_index) = self.list_with_index().await?;
        Ok((objects, Some(last_index)))
    }
}
