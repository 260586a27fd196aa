//! Storage backend selection.
//!
//! `STORAGE_BACKEND` picks the substrate (`kube`, `file` or `consul`);
//! the remaining variables configure the chosen backend.

use crate::error::IngressControllerError;
use config_api::{Upstream, VirtualHost};
use config_store::ObjectClient;
use config_store::consul::ConsulStorage;
use config_store::file::FileStorage;
use config_store::kube::KubeStorage;
use consul_client::ConsulClient;
use kube::Client;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct StorageHandles {
    pub upstreams: Arc<dyn ObjectClient<Upstream>>,
    pub virtual_hosts: Arc<dyn ObjectClient<VirtualHost>>,
}

pub fn storage_from_env(client: Client) -> Result<StorageHandles, IngressControllerError> {
    let backend = env::var("STORAGE_BACKEND").unwrap_or_else(|_| "kube".to_string());
    let sync_frequency = env::var("STORAGE_SYNC_FREQUENCY_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(30));
    info!("  Storage backend: {backend}");

    match backend.as_str() {
        "kube" => {
            let namespace =
                env::var("STORAGE_NAMESPACE").unwrap_or_else(|_| "gateway-system".to_string());
            let storage = KubeStorage::new(client, namespace);
            Ok(StorageHandles {
                upstreams: Arc::new(storage.upstreams()),
                virtual_hosts: Arc::new(storage.virtual_hosts()),
            })
        }
        "file" => {
            let root =
                env::var("FILE_STORAGE_ROOT").unwrap_or_else(|_| "/var/lib/gateway".to_string());
            let storage = FileStorage::new(root, sync_frequency);
            Ok(StorageHandles {
                upstreams: Arc::new(storage.upstreams()),
                virtual_hosts: Arc::new(storage.virtual_hosts()),
            })
        }
        "consul" => {
            let addr = env::var("CONSUL_HTTP_ADDR")
                .unwrap_or_else(|_| "http://127.0.0.1:8500".to_string());
            let root = env::var("CONSUL_ROOT_PATH").unwrap_or_else(|_| "gateway".to_string());
            let storage = ConsulStorage::new(ConsulClient::new(addr)?, root, sync_frequency);
            Ok(StorageHandles {
                upstreams: Arc::new(storage.upstreams()),
                virtual_hosts: Arc::new(storage.virtual_hosts()),
            })
        }
        other => Err(IngressControllerError::InvalidConfig(format!(
            "unknown STORAGE_BACKEND {other:?} (expected kube, file or consul)"
        ))),
    }
}
