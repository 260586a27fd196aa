//! Service controller errors.

use config_store::StorageError;
use consul_client::ConsulError;
use controller_core::ControllerError;
use thiserror::Error;

/// Errors that can occur in the service controller.
#[derive(Debug, Error)]
pub enum ServiceControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Consul client error
    #[error("Consul error: {0}")]
    Consul(#[from] ConsulError),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Controller runtime error
    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
