//! Mock ConsulKv for unit testing
//!
//! In-memory implementation of `ConsulKv` with real index semantics: a
//! global index advances on every write, keys remember their create and
//! modify indexes, and check-and-set refuses stale indexes. This lets the
//! storage backend's concurrency behavior be tested without an agent.

use crate::error::ConsulError;
use crate::kv_trait::ConsulKv;
use crate::models::{KvList, KvPair};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    create_index: u64,
    modify_index: u64,
}

/// Mock Consul KV store for testing
#[derive(Clone, Default)]
pub struct MockConsulKv {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    index: u64,
}

impl MockConsulKv {
    /// Create an empty mock store
    pub fn new() -> Self {
        Self::default()
    }

    /// Current global index (for test assertions)
    pub fn index(&self) -> u64 {
        self.inner.lock().unwrap().index
    }
}

impl Inner {
    fn write(&mut self, key: &str, value: &[u8]) {
        self.index += 1;
        let index = self.index;
        self.entries
            .entry(key.to_string())
            .and_modify(|e| {
                e.value = value.to_vec();
                e.modify_index = index;
            })
            .or_insert_with(|| Entry {
                value: value.to_vec(),
                create_index: index,
                modify_index: index,
            });
    }

    fn pair(&self, key: &str) -> Option<KvPair> {
        self.entries.get(key).map(|e| KvPair {
            key: key.to_string(),
            value: e.value.clone(),
            create_index: e.create_index,
            modify_index: e.modify_index,
        })
    }
}

#[async_trait::async_trait]
impl ConsulKv for MockConsulKv {
    async fn get(&self, key: &str, _consistent: bool) -> Result<Option<KvPair>, ConsulError> {
        Ok(self.inner.lock().unwrap().pair(key))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), ConsulError> {
        self.inner.lock().unwrap().write(key, value);
        Ok(())
    }

    async fn put_cas(&self, key: &str, value: &[u8], index: u64) -> Result<bool, ConsulError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get(key) {
            // cas=0 means "create only if absent"
            None if index == 0 => {}
            None => return Ok(false),
            Some(entry) if entry.modify_index != index => return Ok(false),
            Some(_) => {}
        }
        inner.write(key, value);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), ConsulError> {
        let mut inner = self.inner.lock().unwrap();
        inner.index += 1;
        inner.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<KvList, ConsulError> {
        let inner = self.inner.lock().unwrap();
        let normalized = prefix.trim_end_matches('/');
        let mut pairs: Vec<KvPair> = inner
            .entries
            .keys()
            .filter(|k| {
                k.strip_prefix(normalized)
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            })
            .filter_map(|k| inner.pair(k))
            .collect();
        pairs.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(KvList {
            pairs,
            last_index: inner.index,
        })
    }
}
