//! Persistence for rate limit entries.
//!
//! The limiter only ever talks to an [`EntryStore`]. Which store backs it is
//! decided once, by [`connect`], from the service configuration: the REST
//! pipeline store when credentials are present, otherwise the process-local
//! memory store.

mod memory;
mod pipeline;
mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::ratelimit::RateLimitEntry;

pub use memory::MemoryStore;
pub use pipeline::{KvBackend, PipelineClient, SCAN_PAGE_SIZE};
pub use remote::RemoteEntryStore;

#[cfg(test)]
pub(crate) use remote::tests::FakeKv;

/// Which kind of storage produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The shared REST key-value store
    Redis,
    /// The process-local fallback
    Memory,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Redis => f.write_str("redis"),
            BackendKind::Memory => f.write_str("memory"),
        }
    }
}

/// Load and save rate limit entries by key.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// The storage kind behind this store.
    fn kind(&self) -> BackendKind;

    /// Load the entry for `key`, if any.
    async fn load(&self, key: &str) -> Result<Option<RateLimitEntry>>;

    /// Persist the entry for `key`.
    async fn save(&self, key: &str, entry: &RateLimitEntry, now: DateTime<Utc>) -> Result<()>;

    /// Remove every entry this store owns.
    async fn reset(&self) -> Result<()>;
}

/// Build the entry store described by `config`.
///
/// Missing store credentials are not an error: the memory store is used and,
/// when called inside a Tokio runtime, its sweeper is started.
pub fn connect(config: &ServiceConfig) -> Result<Arc<dyn EntryStore>> {
    if config.store.is_configured() {
        let client = PipelineClient::from_config(&config.store)?;
        info!(url = %client.base_url(), "Using REST key-value store for rate limits");
        return Ok(Arc::new(RemoteEntryStore::new(client, &config.namespace)));
    }

    info!("No key-value store configured, using in-memory rate limits");
    let store = Arc::new(MemoryStore::new());
    if tokio::runtime::Handle::try_current().is_ok() {
        MemoryStore::spawn_sweeper(&store, config.memory.sweep_interval());
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    #[test]
    fn test_backend_kind_names() {
        assert_eq!(BackendKind::Redis.to_string(), "redis");
        assert_eq!(
            serde_json::to_string(&BackendKind::Memory).unwrap(),
            "\"memory\""
        );
    }

    #[test]
    fn test_connect_without_credentials_uses_memory() {
        let store = connect(&ServiceConfig::default()).unwrap();
        assert_eq!(store.kind(), BackendKind::Memory);
    }

    #[test]
    fn test_memory_store_outside_runtime() {
        let store = connect(&ServiceConfig::default()).unwrap();
        let entry = tokio_test::block_on(store.load("ratelimit:missing")).unwrap();
        assert!(entry.is_none());
    }

    #[tokio::test]
    async fn test_connect_with_credentials_uses_remote() {
        let config = ServiceConfig {
            store: StoreConfig {
                url: Some("https://kv.example.com".to_string()),
                token: Some("secret".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let store = connect(&config).unwrap();
        assert_eq!(store.kind(), BackendKind::Redis);
    }
}
