//! ConsulKv trait for mocking
//!
//! Abstracts the KV operations so the storage backend can be unit tested
//! against an in-memory implementation. The concrete `ConsulClient`
//! implements this trait.

use crate::error::ConsulError;
use crate::models::{KvList, KvPair};

/// Consul KV operations used by the storage backend.
#[async_trait::async_trait]
pub trait ConsulKv: Send + Sync {
    /// Reads a single key. `consistent` requests a strongly consistent read.
    async fn get(&self, key: &str, consistent: bool) -> Result<Option<KvPair>, ConsulError>;

    /// Writes a key unconditionally.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), ConsulError>;

    /// Check-and-set write. Returns `false` when the key's modify index no
    /// longer matches `index` (the caller lost the race); transport
    /// failures are errors, a refused swap is not.
    async fn put_cas(&self, key: &str, value: &[u8], index: u64) -> Result<bool, ConsulError>;

    /// Deletes a key. Consul treats deleting a missing key as success.
    async fn delete(&self, key: &str) -> Result<(), ConsulError>;

    /// Lists every pair under `prefix`, along with the query's last index.
    async fn list(&self, prefix: &str) -> Result<KvList, ConsulError>;
}
