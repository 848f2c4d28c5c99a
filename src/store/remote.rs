//! Entry store backed by a remote key-value backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::pipeline::KvBackend;
use super::{BackendKind, EntryStore};
use crate::error::Result;
use crate::ratelimit::RateLimitEntry;

/// Stores entries as JSON strings with a TTL matching their lifetime.
pub struct RemoteEntryStore<B: KvBackend> {
    backend: B,
    namespace: String,
}

impl<B: KvBackend> RemoteEntryStore<B> {
    /// Wrap a backend. `namespace` scopes what [`EntryStore::reset`] deletes.
    pub fn new(backend: B, namespace: &str) -> Self {
        Self {
            backend,
            namespace: namespace.to_string(),
        }
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

#[async_trait]
impl<B: KvBackend> EntryStore for RemoteEntryStore<B> {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn load(&self, key: &str) -> Result<Option<RateLimitEntry>> {
        let Some(raw) = self.backend.get(key).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding unreadable rate limit entry");
                self.backend.delete(&[key.to_string()]).await?;
                Ok(None)
            }
        }
    }

    async fn save(&self, key: &str, entry: &RateLimitEntry, now: DateTime<Utc>) -> Result<()> {
        let value = serde_json::to_string(entry)?;
        self.backend.set(key, &value, entry.ttl_secs(now)).await
    }

    async fn reset(&self) -> Result<()> {
        let pattern = format!("{}:*", self.namespace);
        let keys = self.backend.scan(&pattern).await?;
        self.backend.delete(&keys).await?;
        info!(pattern = %pattern, deleted = keys.len(), "Cleared remote rate limit entries");
        Ok(())
    }
}
