//! In-memory storage backend for unit testing
//!
//! Honors the full error taxonomy (AlreadyExists, NotFound, Conflict on a
//! stale resource version) and records every issued write so reconciler
//! tests can assert the exact set of calls a pass produced.

use crate::{CollectionHandler, ObjectClient, StorableObject, StorageError, Watch};
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// A write issued against a [`MemoryClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedOp {
    Create(String),
    Update(String),
    Delete(String),
}

/// In-memory object store for testing
#[derive(Clone)]
pub struct MemoryClient<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

struct Inner<T> {
    objects: HashMap<String, T>,
    ops: Vec<RecordedOp>,
    next_version: u64,
    fail_updates: bool,
}

impl<T> Default for MemoryClient<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                objects: HashMap::new(),
                ops: Vec::new(),
                next_version: 0,
                fail_updates: false,
            })),
        }
    }
}

impl<T: StorableObject> MemoryClient<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an object without recording an op (test setup).
    pub fn seed(&self, mut obj: T) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_version += 1;
        obj.meta_mut().resource_version = Some(inner.next_version.to_string());
        inner.objects.insert(obj.name_any(), obj);
    }

    /// Drains the recorded write log.
    pub fn take_ops(&self) -> Vec<RecordedOp> {
        std::mem::take(&mut self.inner.lock().unwrap().ops)
    }

    /// Makes every subsequent update fail with `Conflict`.
    pub fn fail_updates(&self) {
        self.inner.lock().unwrap().fail_updates = true;
    }

    /// Snapshot of the stored objects by name.
    pub fn objects(&self) -> HashMap<String, T> {
        self.inner.lock().unwrap().objects.clone()
    }
}

#[async_trait::async_trait]
impl<T: StorableObject> ObjectClient<T> for MemoryClient<T> {
    async fn create(&self, obj: &T) -> Result<T, StorageError> {
        let name = obj.name_any();
        if name.is_empty() {
            return Err(StorageError::MissingName);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.objects.contains_key(&name) {
            return Err(StorageError::already_exists::<T>(&name));
        }
        inner.next_version += 1;
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(inner.next_version.to_string());
        inner.objects.insert(name.clone(), stored.clone());
        inner.ops.push(RecordedOp::Create(name));
        Ok(stored)
    }

    async fn update(&self, obj: &T) -> Result<T, StorageError> {
        let name = obj.name_any();
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_updates {
            return Err(StorageError::conflict::<T>(&name));
        }
        let Some(current) = inner.objects.get(&name) else {
            return Err(StorageError::not_found::<T>(&name));
        };
        // an explicitly presented stale version loses the race
        if let Some(presented) = &obj.meta().resource_version
            && current.meta().resource_version.as_ref() != Some(presented)
        {
            return Err(StorageError::conflict::<T>(&name));
        }
        inner.next_version += 1;
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(inner.next_version.to_string());
        inner.objects.insert(name.clone(), stored.clone());
        inner.ops.push(RecordedOp::Update(name));
        Ok(stored)
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.objects.remove(name).is_none() {
            return Err(StorageError::not_found::<T>(name));
        }
        inner.ops.push(RecordedOp::Delete(name.to_string()));
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<T, StorageError> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::not_found::<T>(name))
    }

    async fn list(&self) -> Result<Vec<T>, StorageError> {
        let mut objects: Vec<T> = self.inner.lock().unwrap().objects.values().cloned().collect();
        objects.sort_by_key(|obj| obj.name_any());
        Ok(objects)
    }

    async fn watch(
        &self,
        _handlers: Vec<Arc<dyn CollectionHandler<T>>>,
    ) -> Result<Box<dyn Watch>, StorageError> {
        Ok(Box::new(IdleWatch))
    }
}

/// A watch that only waits for the stop signal; the memory backend has no
/// change feed.
struct IdleWatch;

#[async_trait::async_trait]
impl Watch for IdleWatch {
    async fn run(
        self: Box<Self>,
        mut stop: watch::Receiver<bool>,
        _errors: mpsc::Sender<StorageError>,
    ) {
        let _ = stop.changed().await;
    }
}
