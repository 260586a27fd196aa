//! Consul client errors

use thiserror::Error;

/// Errors that can occur when talking to the Consul HTTP API
#[derive(Debug, Error)]
pub enum ConsulError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Consul returned a non-success status
    #[error("Consul API error: {0}")]
    Api(String),

    /// A KV value was not valid base64
    #[error("Invalid KV value encoding: {0}")]
    Decode(#[from] base64::DecodeError),

    /// The response body did not have the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}
