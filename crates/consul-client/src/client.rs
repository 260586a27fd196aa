//! Consul KV HTTP client
//!
//! Implements the `/v1/kv` endpoints. Values come back base64-encoded in a
//! JSON array; `X-Consul-Index` on listings is the freshness token used by
//! the polling watcher.

use crate::error::ConsulError;
use crate::kv_trait::ConsulKv;
use crate::models::{KvList, KvPair};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const CONSUL_INDEX_HEADER: &str = "X-Consul-Index";

/// Wire form of a KV pair as returned by `/v1/kv`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawKvPair {
    key: String,
    value: Option<String>,
    create_index: u64,
    modify_index: u64,
}

impl RawKvPair {
    fn decode(self) -> Result<KvPair, ConsulError> {
        let value = match self.value {
            Some(encoded) => BASE64.decode(encoded)?,
            None => Vec::new(),
        };
        Ok(KvPair {
            key: self.key,
            value,
            create_index: self.create_index,
            modify_index: self.modify_index,
        })
    }
}

/// Consul KV API client
pub struct ConsulClient {
    client: Client,
    base_url: String,
}

impl ConsulClient {
    /// Create a new client
    ///
    /// # Arguments
    /// * `base_url` - Consul agent address (e.g. "http://127.0.0.1:8500")
    pub fn new(base_url: String) -> Result<Self, ConsulError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base_url, key)
    }

    async fn api_error(response: reqwest::Response) -> ConsulError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        ConsulError::Api(format!("{status}: {body}"))
    }
}

#[async_trait::async_trait]
impl ConsulKv for ConsulClient {
    async fn get(&self, key: &str, consistent: bool) -> Result<Option<KvPair>, ConsulError> {
        let mut request = self.client.get(self.kv_url(key));
        if consistent {
            request = request.query(&[("consistent", "")]);
        }
        let response = request.send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let mut pairs: Vec<RawKvPair> = response.json().await?;
        match pairs.pop() {
            Some(raw) => Ok(Some(raw.decode()?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), ConsulError> {
        debug!(key, "consul put");
        let response = self
            .client
            .put(self.kv_url(key))
            .body(value.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        // The body is a JSON bool; a plain put only reports false on an
        // invalid request, which surfaces as an API error above.
        Ok(())
    }

    async fn put_cas(&self, key: &str, value: &[u8], index: u64) -> Result<bool, ConsulError> {
        debug!(key, index, "consul cas put");
        let response = self
            .client
            .put(self.kv_url(key))
            .query(&[("cas", index.to_string())])
            .body(value.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let accepted: bool = response.json().await?;
        Ok(accepted)
    }

    async fn delete(&self, key: &str) -> Result<(), ConsulError> {
        debug!(key, "consul delete");
        let response = self.client.delete(self.kv_url(key)).send().await?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<KvList, ConsulError> {
        let response = self
            .client
            .get(self.kv_url(prefix))
            .query(&[("recurse", "")])
            .send()
            .await?;

        // An empty prefix is a 404, not an error; it still carries an index.
        let status = response.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(Self::api_error(response).await);
        }

        let last_index = response
            .headers()
            .get(CONSUL_INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        if status == StatusCode::NOT_FOUND {
            return Ok(KvList {
                pairs: Vec::new(),
                last_index,
            });
        }

        let raw: Vec<RawKvPair> = response.json().await?;
        let pairs = raw
            .into_iter()
            .map(RawKvPair::decode)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(KvList { pairs, last_index })
    }
}
