//! Storage error taxonomy.
//!
//! `AlreadyExists`, `NotFound` and `Conflict` are the portable outcomes the
//! reconcilers branch on; everything else wraps a backend transport or
//! codec failure with enough context to name the operation and object.

use crate::StorableObject;
use consul_client::ConsulError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by the storage backends
#[derive(Debug, Error)]
pub enum StorageError {
    /// Create against an existing name
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    /// Update/Get/Delete against a missing name
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// Update lost a race against a concurrent writer (resource version /
    /// CAS mismatch); retry after re-reading
    #[error("resource version conflict on {kind} {name}")]
    Conflict { kind: String, name: String },

    /// Object has no metadata.name
    #[error("object has no name")]
    MissingName,

    /// Consul transport error
    #[error("consul {op} {key}: {source}")]
    Consul {
        op: &'static str,
        key: String,
        #[source]
        source: ConsulError,
    },

    /// Kubernetes API error
    #[error("kubernetes {op} {name}: {source}")]
    Kube {
        op: &'static str,
        name: String,
        #[source]
        source: kube::Error,
    },

    /// Filesystem error
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored YAML document failed to round-trip
    #[error("invalid document at {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A stored JSON value failed to round-trip
    #[error("invalid value at {key}: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Watch stream error
    #[error("watch failed: {0}")]
    Watch(String),
}

impl StorageError {
    pub fn already_exists<T: StorableObject>(name: &str) -> Self {
        StorageError::AlreadyExists {
            kind: T::kind(&()).into_owned(),
            name: name.to_string(),
        }
    }

    pub fn not_found<T: StorableObject>(name: &str) -> Self {
        StorageError::NotFound {
            kind: T::kind(&()).into_owned(),
            name: name.to_string(),
        }
    }

    pub fn conflict<T: StorableObject>(name: &str) -> Self {
        StorageError::Conflict {
            kind: T::kind(&()).into_owned(),
            name: name.to_string(),
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StorageError::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }
}
