//! Rate limiter trait for the layers that sit above the core.

use async_trait::async_trait;

use super::descriptor::RequestDescriptor;
use super::limiter::{CheckOptions, RateLimitConfig, RateLimitResult};
use crate::error::Result;
use crate::metrics::RateLimitMetrics;

/// Anything that can decide a single rate limit check.
///
/// The policy wrapper and the content facade are written against this trait
/// so they can run over the real [`RateLimiter`](super::RateLimiter) or a
/// test double.
#[async_trait]
pub trait RateLimitChecker: Send + Sync {
    /// Count one request against `config` and return the verdict.
    async fn check(
        &self,
        request: &RequestDescriptor,
        config: &RateLimitConfig,
        options: &CheckOptions,
    ) -> Result<RateLimitResult>;

    /// Counters to record fail-open decisions in, if any.
    fn metrics(&self) -> Option<&RateLimitMetrics> {
        None
    }
}
