//! Consul KV data types

/// A decoded key/value pair.
///
/// `modify_index` is Consul's per-key optimistic-concurrency token; it is
/// what the storage layer surfaces as an object's resource version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub create_index: u64,
    pub modify_index: u64,
}

/// The result of a recursive listing.
///
/// `last_index` is the `X-Consul-Index` reported for the query; it only
/// moves when something under the prefix changed, which makes it a cheap
/// freshness token for polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvList {
    pub pairs: Vec<KvPair>,
    pub last_index: u64,
}
