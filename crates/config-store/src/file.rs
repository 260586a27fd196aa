//! File storage backend.
//!
//! One directory per kind under a configured root, one YAML document per
//! object. Every operation re-lists or re-parses from disk; listing cost is
//! O(n) in the number of stored objects, a deliberate simplicity trade for
//! a backend meant for small local setups. Files carry no resource
//! versions, so updates are last-writer-wins.

use crate::poll::{PollSource, PollWatcher};
use crate::{CollectionHandler, ObjectClient, StorableObject, StorageError, Watch};
use config_api::{Upstream, VirtualHost};
use kube::ResourceExt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// File-tree storage rooted at a configured directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
    sync_frequency: Duration,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>, sync_frequency: Duration) -> Self {
        Self {
            root: root.into(),
            sync_frequency,
        }
    }

    pub fn upstreams(&self) -> FileObjectClient<Upstream> {
        FileObjectClient::new(&self.root, self.sync_frequency)
    }

    pub fn virtual_hosts(&self) -> FileObjectClient<VirtualHost> {
        FileObjectClient::new(&self.root, self.sync_frequency)
    }
}

/// File-backed client for one object kind.
#[derive(Debug)]
pub struct FileObjectClient<T> {
    dir: PathBuf,
    sync_frequency: Duration,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Clone for FileObjectClient<T> {
    fn clone(&self) -> Self {
        Self {
            dir: self.dir.clone(),
            sync_frequency: self.sync_frequency,
            _kind: PhantomData,
        }
    }
}

impl<T: StorableObject> FileObjectClient<T> {
    fn new(root: &Path, sync_frequency: Duration) -> Self {
        Self {
            dir: root.join(T::plural(&()).as_ref()),
            sync_frequency,
            _kind: PhantomData,
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.yaml"))
    }

    fn named(obj: &T) -> Result<String, StorageError> {
        let name = obj.name_any();
        if name.is_empty() {
            return Err(StorageError::MissingName);
        }
        Ok(name)
    }

    async fn write(&self, path: &Path, obj: &T) -> Result<(), StorageError> {
        let doc = serde_yaml::to_string(obj).map_err(|source| StorageError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StorageError::Io {
                op: "create dir",
                path: self.dir.clone(),
                source,
            })?;
        tokio::fs::write(path, doc)
            .await
            .map_err(|source| StorageError::Io {
                op: "write",
                path: path.to_path_buf(),
                source,
            })
    }

    async fn read(&self, path: &Path, name: &str) -> Result<T, StorageError> {
        let doc = match tokio::fs::read_to_string(path).await {
            Ok(doc) => doc,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::not_found::<T>(name));
            }
            Err(source) => {
                return Err(StorageError::Io {
                    op: "read",
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_yaml::from_str(&doc).map_err(|source| StorageError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[async_trait::async_trait]
impl<T: StorableObject> ObjectClient<T> for FileObjectClient<T> {
    async fn create(&self, obj: &T) -> Result<T, StorageError> {
        let name = Self::named(obj)?;
        let path = self.path_for(&name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StorageError::already_exists::<T>(&name));
        }
        debug!(name, path = %path.display(), "creating object file");
        self.write(&path, obj).await?;
        Ok(obj.clone())
    }

    async fn update(&self, obj: &T) -> Result<T, StorageError> {
        let name = Self::named(obj)?;
        let path = self.path_for(&name);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StorageError::not_found::<T>(&name));
        }
        debug!(name, path = %path.display(), "updating object file");
        self.write(&path, obj).await?;
        Ok(obj.clone())
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        let path = self.path_for(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::not_found::<T>(name))
            }
            Err(source) => Err(StorageError::Io {
                op: "remove",
                path,
                source,
            }),
        }
    }

    async fn get(&self, name: &str) -> Result<T, StorageError> {
        self.read(&self.path_for(name), name).await
    }

    async fn list(&self) -> Result<Vec<T>, StorageError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            // an unused kind directory simply does not exist yet
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StorageError::Io {
                    op: "list dir",
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut paths = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| StorageError::Io {
                op: "list dir",
                path: self.dir.clone(),
                source,
            })?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "yaml") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut objects = Vec::with_capacity(paths.len());
        for path in paths {
            let name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            objects.push(self.read(&path, &name).await?);
        }
        Ok(objects)
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
impl<T: StorableObject> PollSource<T> for FileObjectClient<T> {
    async fn poll(&self) -> Result<(Vec<T>, Option<u64>), StorageError> {
        // no freshness token on plain files, every tick re-reads
        Ok((self.list().await?, None))
    }
}
