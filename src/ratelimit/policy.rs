//! Policy-level rate limiting that never fails closed.
//!
//! Request handlers call into this layer rather than the core. Any error from
//! the underlying checker is logged and turned into an allowed verdict, so a
//! store outage degrades to "no rate limiting" instead of "no service".

use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::Serialize;
use tracing::warn;

use super::backend::RateLimitChecker;
use super::descriptor::RequestDescriptor;
use super::entry::{millis_to_datetime, window_millis};
use super::headers::rate_limit_headers;
use super::limiter::CheckOptions;
use super::rules::{classify_path, Policy};

/// Message attached to verdicts produced while the limiter is failing.
pub const DEGRADED_MESSAGE: &str = "Rate limiting temporarily unavailable";

/// A header-ready rate limit verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyVerdict {
    /// The policy that was applied
    pub policy: Policy,
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
    /// The policy message when refused, or a note when degraded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PolicyVerdict {
    /// Project onto the standard rate limit headers.
    pub fn headers(&self) -> HeaderMap {
        rate_limit_headers(self.limit, self.remaining, self.reset, self.retry_after)
    }

    /// Whether this verdict was produced by failing open.
    pub fn is_degraded(&self) -> bool {
        self.message.as_deref() == Some(DEGRADED_MESSAGE)
    }
}

/// Check `request` against a named policy's simple limits.
///
/// Never returns an error: a failing checker yields an allowed verdict
/// carrying [`DEGRADED_MESSAGE`].
pub async fn check_policy<C>(
    checker: &C,
    request: &RequestDescriptor,
    policy: Policy,
    identifier: Option<&str>,
) -> PolicyVerdict
where
    C: RateLimitChecker + ?Sized,
{
    let config = policy.config();
    let mut options = CheckOptions::new();
    if let Some(identifier) = identifier {
        options = options.with_identifier(identifier);
    }

    match checker.check(request, &config, &options).await {
        Ok(result) => PolicyVerdict {
            policy,
            allowed: result.allowed,
            limit: result.limit,
            remaining: result.remaining,
            reset: result.reset,
            retry_after: result.retry_after,
            message: (!result.allowed).then(|| config.message.clone()),
        },
        Err(e) => {
            warn!(
                policy = %policy,
                identifier = identifier.unwrap_or("<derived>"),
                error = %e,
                "Rate limit check failed, allowing request"
            );
            if let Some(metrics) = checker.metrics() {
                metrics.record_fail_open();
            }
            let reset_at = Utc::now().timestamp_millis() + window_millis(config.window);
            PolicyVerdict {
                policy,
                allowed: true,
                limit: config.max,
                remaining: config.max,
                reset: millis_to_datetime(reset_at),
                retry_after: None,
                message: Some(DEGRADED_MESSAGE.to_string()),
            }
        }
    }
}

/// Classify `request` by its path and check the matching policy.
pub async fn check_request<C>(
    checker: &C,
    request: &RequestDescriptor,
    identifier: Option<&str>,
) -> PolicyVerdict
where
    C: RateLimitChecker + ?Sized,
{
    let policy = classify_path(request.path());
    check_policy(checker, request, policy, identifier).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimiter;
    use crate::store::{FakeKv, MemoryStore, RemoteEntryStore};
    use std::sync::Arc;

    fn memory_limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_allowed_verdict_has_no_message() {
        let limiter = memory_limiter();
        let request = RequestDescriptor::new("/api/tools/quick-copy");

        let verdict = check_request(&limiter, &request, Some("user-1")).await;
        assert_eq!(verdict.policy, Policy::AiStandard);
        assert!(verdict.allowed);
        assert_eq!(verdict.limit, 60);
        assert_eq!(verdict.remaining, 59);
        assert_eq!(verdict.message, None);
    }

    #[tokio::test]
    async fn test_denied_verdict_carries_policy_message() {
        let limiter = memory_limiter();
        let request = RequestDescriptor::new("/api/auth/login");

        for _ in 0..20 {
            assert!(check_request(&limiter, &request, Some("ip-1")).await.allowed);
        }
        let verdict = check_request(&limiter, &request, Some("ip-1")).await;
        assert!(!verdict.allowed);
        assert_eq!(
            verdict.message.as_deref(),
            Some("Too many authentication attempts. Please try again in 15 minutes.")
        );
        assert!(verdict.retry_after.is_some());
        assert!(verdict.headers().contains_key("retry-after"));
    }

    #[tokio::test]
    async fn test_backend_failure_fails_open() {
        let limiter =
            RateLimiter::new(Arc::new(RemoteEntryStore::new(FakeKv::failing(), "ratelimit")));
        let request = RequestDescriptor::new("/api/users/update");

        let verdict = check_policy(&limiter, &request, Policy::Sensitive, Some("admin")).await;
        assert!(verdict.allowed);
        assert!(verdict.is_degraded());
        assert_eq!(verdict.remaining, 50);
        assert_eq!(limiter.metrics().snapshot().fail_open, 1);
    }

    #[tokio::test]
    async fn test_works_through_trait_object() {
        let limiter: Arc<dyn RateLimitChecker> = Arc::new(memory_limiter());
        let request = RequestDescriptor::new("/dashboard");
        let verdict = check_request(limiter.as_ref(), &request, None).await;
        assert_eq!(verdict.policy, Policy::Api);
        assert!(verdict.allowed);
    }
}
