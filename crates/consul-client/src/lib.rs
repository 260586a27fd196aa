//! Consul KV HTTP API Client
//!
//! A small client for the parts of the Consul KV API the gateway storage
//! backend needs: reads (optionally with strong consistency), plain and
//! check-and-set writes, deletes, and recursive listings that carry the
//! collection's modify index for change detection.
//!
//! # Example
//!
//! ```no_run
//! use consul_client::{ConsulClient, ConsulKv};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ConsulClient::new("http://127.0.0.1:8500".to_string())?;
//!
//! client.put("gateway/upstreams/my-upstream", b"{}").await?;
//! let listing = client.list("gateway/upstreams").await?;
//! println!("{} keys at index {}", listing.pairs.len(), listing.last_index);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod kv_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::ConsulClient;
pub use error::ConsulError;
pub use kv_trait::ConsulKv;
pub use models::{KvList, KvPair};
#[cfg(feature = "test-util")]
pub use mock::MockConsulKv;
