//! Process-local entry store.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{BackendKind, EntryStore};
use crate::error::Result;
use crate::ratelimit::RateLimitEntry;

/// In-memory entry store used when no key-value backend is configured.
///
/// Concurrent checks on the same key may interleave their read and write,
/// so counts are approximate under contention.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, RateLimitEntry>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the periodic sweep of stale entries.
    ///
    /// The task only holds a weak reference and stops once the store is
    /// dropped. Calling this again replaces the previous task.
    pub fn spawn_sweeper(store: &Arc<Self>, every: Duration) {
        let weak: Weak<Self> = Arc::downgrade(store);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                store.sweep(Utc::now());
            }
        });

        info!(interval_secs = every.as_secs(), "Started rate limit sweeper");
        if let Some(previous) = store.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Drop entries whose window is over and which are not blocked.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.window_expired(now) || entry.is_blocked(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Swept expired rate limit entries");
        }
        removed
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl EntryStore for MemoryStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn load(&self, key: &str) -> Result<Option<RateLimitEntry>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn save(&self, key: &str, entry: &RateLimitEntry, _now: DateTime<Utc>) -> Result<()> {
        self.entries.insert(key.to_string(), entry.clone());
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.entries.clear();
        info!("Cleared in-memory rate limit entries");
        Ok(())
    }
}
