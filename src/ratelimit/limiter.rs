//! Core rate limiter implementation.
//!
//! Fixed windows with a penalty box: a key that keeps hitting a full window
//! is blocked outright after [`VIOLATIONS_BEFORE_BLOCK`] refusals, for one
//! window, then twice that, and so on up to an hour.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::backend::RateLimitChecker;
use super::descriptor::{RateLimitKey, RequestDescriptor};
use super::entry::{millis_to_datetime, seconds_until, RateLimitEntry, VIOLATIONS_BEFORE_BLOCK};
use super::headers::rate_limit_headers;
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::metrics::RateLimitMetrics;
use crate::store::{self, BackendKind, EntryStore};

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "ratelimit";

/// Configuration for a rate limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Length of one counting window
    pub window: Duration,
    /// Requests allowed per window
    pub max: u32,
    /// Scopes keys so different limits never share a counter
    pub key_prefix: String,
    /// Shown to callers who are refused
    pub message: String,
    /// Successful requests can be refunded via [`RateLimiter::record_success`]
    pub skip_successful_requests: bool,
}

impl RateLimitConfig {
    /// Create a configuration.
    pub fn new(
        window: Duration,
        max: u32,
        key_prefix: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            window,
            max,
            key_prefix: key_prefix.into(),
            message: message.into(),
            skip_successful_requests: false,
        }
    }

    /// Refund requests the caller reports as successful.
    pub fn skip_successful_requests(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }
}

/// Per-call options for a check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckOptions {
    /// Explicit caller identity; wins over anything derived from headers
    pub identifier: Option<String>,
    /// Extra scope, e.g. the resource being acted on
    pub key_parts: Vec<Option<String>>,
}

impl CheckOptions {
    /// Options with no identifier and no key parts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit identifier.
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Append key parts.
    pub fn with_key_parts<I, S>(mut self, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_parts.extend(parts.into_iter().map(|p| Some(p.into())));
        self
    }
}

/// The outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests allowed per window
    pub limit: u32,
    /// Requests left in the window
    pub remaining: u32,
    /// When the window or block ends
    pub reset: DateTime<Utc>,
    /// Seconds to wait before retrying, when refused
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Storage that decided this verdict
    pub backend: BackendKind,
}

impl RateLimitResult {
    /// Project this verdict onto the standard rate limit headers.
    pub fn headers(&self) -> HeaderMap {
        rate_limit_headers(self.limit, self.remaining, self.reset, self.retry_after)
    }
}

/// The core rate limiter.
///
/// Cheap to share behind an `Arc`; all state lives in the entry store.
pub struct RateLimiter {
    store: Arc<dyn EntryStore>,
    namespace: String,
    metrics: Arc<RateLimitMetrics>,
}

impl RateLimiter {
    /// Create a rate limiter over the given store.
    pub fn new(store: Arc<dyn EntryStore>) -> Self {
        Self::with_namespace(store, DEFAULT_NAMESPACE)
    }

    /// Create a rate limiter whose keys live under `namespace`.
    pub fn with_namespace(store: Arc<dyn EntryStore>, namespace: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            metrics: Arc::new(RateLimitMetrics::new()),
        }
    }

    /// Build the store described by `config` and a limiter over it.
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let store = store::connect(config)?;
        Ok(Self::with_namespace(store, &config.namespace))
    }

    /// The storage kind backing this limiter.
    pub fn backend(&self) -> BackendKind {
        self.store.kind()
    }

    /// Decision counters.
    pub fn metrics(&self) -> &Arc<RateLimitMetrics> {
        &self.metrics
    }

    /// The key a check with these arguments would count against.
    pub fn key_for(
        &self,
        request: &RequestDescriptor,
        config: &RateLimitConfig,
        options: &CheckOptions,
    ) -> RateLimitKey {
        let identifier = options
            .identifier
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| request.client_identity());

        RateLimitKey::new(
            &self.namespace,
            &config.key_prefix,
            &options.key_parts,
            &identifier,
        )
    }

    /// Count one request and decide whether it may proceed.
    pub async fn check(
        &self,
        request: &RequestDescriptor,
        config: &RateLimitConfig,
        options: &CheckOptions,
    ) -> Result<RateLimitResult> {
        self.check_at(Utc::now(), request, config, options).await
    }

    /// Like [`check`](Self::check), as of `now`.
    pub async fn check_at(
        &self,
        now: DateTime<Utc>,
        request: &RequestDescriptor,
        config: &RateLimitConfig,
        options: &CheckOptions,
    ) -> Result<RateLimitResult> {
        let key = self.key_for(request, config, options);
        let backend = self.store.kind();

        trace!(key = %key, backend = %backend, "Checking rate limit");

        let mut entry = self.current_entry(&key, config, now).await?;

        if entry.is_blocked(now) {
            // Re-save so the backend TTL keeps pace with the block.
            self.store.save(key.as_str(), &entry, now).await?;
            self.metrics.record_blocked();

            let until = entry.retry_at();
            let retry_after = seconds_until(now, until);
            warn!(
                event = "blocked",
                key = %key,
                retry_after,
                "Request refused while key is blocked"
            );
            return Ok(RateLimitResult {
                allowed: false,
                limit: config.max,
                remaining: 0,
                reset: millis_to_datetime(until),
                retry_after: Some(retry_after),
                backend,
            });
        }

        if entry.count < config.max {
            entry.count += 1;
            self.store.save(key.as_str(), &entry, now).await?;
            self.metrics.record_allowed();

            let remaining = config.max - entry.count;
            debug!(key = %key, count = entry.count, remaining, "Request allowed");
            return Ok(RateLimitResult {
                allowed: true,
                limit: config.max,
                remaining,
                reset: millis_to_datetime(entry.reset_time),
                retry_after: None,
                backend,
            });
        }

        let imposed = entry.record_violation(now, config.window);
        self.store.save(key.as_str(), &entry, now).await?;
        self.metrics.record_violation(imposed.is_some());

        let retry_at = entry.retry_at();
        let retry_after = seconds_until(now, retry_at);
        warn!(
            event = "violation",
            key = %key,
            violations = entry.violations,
            threshold = VIOLATIONS_BEFORE_BLOCK,
            block_secs = imposed.map(|d| d.as_secs()),
            retry_after,
            "Rate limit exceeded"
        );

        Ok(RateLimitResult {
            allowed: false,
            limit: config.max,
            remaining: 0,
            reset: millis_to_datetime(retry_at),
            retry_after: Some(retry_after),
            backend,
        })
    }

    /// The verdict the next request would get, without counting anything.
    pub async fn peek(
        &self,
        request: &RequestDescriptor,
        config: &RateLimitConfig,
        options: &CheckOptions,
    ) -> Result<RateLimitResult> {
        self.peek_at(Utc::now(), request, config, options).await
    }

    /// Like [`peek`](Self::peek), as of `now`.
    pub async fn peek_at(
        &self,
        now: DateTime<Utc>,
        request: &RequestDescriptor,
        config: &RateLimitConfig,
        options: &CheckOptions,
    ) -> Result<RateLimitResult> {
        let key = self.key_for(request, config, options);
        let entry = self.current_entry(&key, config, now).await?;

        let allowed = !entry.is_blocked(now) && entry.count < config.max;
        let (reset_at, retry_after) = if allowed {
            (entry.reset_time, None)
        } else {
            let at = entry.retry_at();
            (at, Some(seconds_until(now, at)))
        };

        Ok(RateLimitResult {
            allowed,
            limit: config.max,
            remaining: if entry.is_blocked(now) {
                0
            } else {
                config.max.saturating_sub(entry.count)
            },
            reset: millis_to_datetime(reset_at),
            retry_after,
            backend: self.store.kind(),
        })
    }

    /// Refund one request for configs that skip successful requests.
    ///
    /// Call after the guarded operation succeeded. Does nothing when the
    /// config does not opt in or the window has already rolled over.
    pub async fn record_success(
        &self,
        request: &RequestDescriptor,
        config: &RateLimitConfig,
        options: &CheckOptions,
    ) -> Result<()> {
        self.record_success_at(Utc::now(), request, config, options).await
    }

    /// Like [`record_success`](Self::record_success), as of `now`.
    pub async fn record_success_at(
        &self,
        now: DateTime<Utc>,
        request: &RequestDescriptor,
        config: &RateLimitConfig,
        options: &CheckOptions,
    ) -> Result<()> {
        if !config.skip_successful_requests {
            return Ok(());
        }

        let key = self.key_for(request, config, options);
        let Some(mut entry) = self.store.load(key.as_str()).await? else {
            return Ok(());
        };
        if entry.window_expired(now) || entry.count == 0 {
            return Ok(());
        }

        entry.count -= 1;
        debug!(key = %key, count = entry.count, "Refunded successful request");
        self.store.save(key.as_str(), &entry, now).await
    }

    /// Remove every rate limit entry.
    ///
    /// Intended for tests and operations, not request handling.
    pub async fn reset_all(&self) -> Result<()> {
        self.store.reset().await
    }

    async fn current_entry(
        &self,
        key: &RateLimitKey,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<RateLimitEntry> {
        Ok(match self.store.load(key.as_str()).await? {
            Some(entry) => entry.roll(now, config.window),
            None => RateLimitEntry::fresh(now, config.window),
        })
    }
}

#[async_trait]
impl RateLimitChecker for RateLimiter {
    async fn check(
        &self,
        request: &RequestDescriptor,
        config: &RateLimitConfig,
        options: &CheckOptions,
    ) -> Result<RateLimitResult> {
        RateLimiter::check(self, request, config, options).await
    }

    fn metrics(&self) -> Option<&RateLimitMetrics> {
        Some(&self.metrics)
    }
}
