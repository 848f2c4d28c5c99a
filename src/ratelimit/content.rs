//! Layered limits for content generation endpoints.
//!
//! Two ceilings apply in order: one per user across everything they do, and
//! one per user per brand. The second check is skipped once the first
//! refuses.

use http::{HeaderMap, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

use super::backend::RateLimitChecker;
use super::descriptor::RequestDescriptor;
use super::limiter::{CheckOptions, RateLimitConfig};
use super::rules::Policy;

/// Which layer refused the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitScope {
    /// The per-user ceiling
    User,
    /// The per-user-per-brand ceiling
    Brand,
}

/// JSON body returned with a 429.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureBody {
    /// Always `false`
    pub success: bool,
    /// The refusing limit's message
    pub error: String,
}

/// Everything a handler needs to answer a refused request.
#[derive(Debug, Clone)]
pub struct ContentLimitFailure {
    /// The layer that refused
    pub scope: LimitScope,
    /// Always `429 Too Many Requests`
    pub status: StatusCode,
    /// JSON body to send
    pub body: FailureBody,
    /// Rate limit headers to send
    pub headers: HeaderMap,
}

/// Result of [`enforce_content_rate_limits`].
#[derive(Debug, Clone)]
pub enum ContentLimitOutcome {
    /// Both layers admitted the request
    Allowed,
    /// A layer refused it
    Denied(ContentLimitFailure),
}

impl ContentLimitOutcome {
    /// Both layers admitted the request.
    pub fn is_allowed(&self) -> bool {
        matches!(self, ContentLimitOutcome::Allowed)
    }
}

/// Which presets each layer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentLimitOptions {
    /// Preset for the per-user layer
    pub user_policy: Policy,
    /// Preset for the per-user-per-brand layer
    pub resource_policy: Policy,
}

impl Default for ContentLimitOptions {
    fn default() -> Self {
        Self {
            user_policy: Policy::AiStandard,
            resource_policy: Policy::AiExpensive,
        }
    }
}

/// Apply the per-user and (with a resource) per-user-per-brand limits.
///
/// Both layers identify the caller by `user_id` alone, so the network
/// address a request arrives from never splits a user's budget.
/// The brand layer keys on both the brand and the user, so it bounds one
/// user's use of one brand rather than the brand's total traffic. A checker
/// error at either layer is logged and treated as an admission.
pub async fn enforce_content_rate_limits<C>(
    checker: &C,
    request: &RequestDescriptor,
    user_id: &str,
    resource_id: Option<&str>,
    options: ContentLimitOptions,
) -> ContentLimitOutcome
where
    C: RateLimitChecker + ?Sized,
{
    let user_config = options.user_policy.preset();
    let user_options = CheckOptions::new()
        .with_identifier(user_id)
        .with_key_parts(["content", "user", user_id]);
    if let Some(failure) =
        check_layer(checker, request, &user_config, &user_options, LimitScope::User).await
    {
        return ContentLimitOutcome::Denied(failure);
    }

    if let Some(resource_id) = resource_id {
        let brand_config = options.resource_policy.preset();
        let brand_options = CheckOptions::new()
            .with_identifier(user_id)
            .with_key_parts(["content", "brand", resource_id, user_id]);
        if let Some(failure) =
            check_layer(checker, request, &brand_config, &brand_options, LimitScope::Brand).await
        {
            return ContentLimitOutcome::Denied(failure);
        }
    }

    debug!(user_id = %user_id, resource_id = ?resource_id, "Content rate limits passed");
    ContentLimitOutcome::Allowed
}

async fn check_layer<C>(
    checker: &C,
    request: &RequestDescriptor,
    config: &RateLimitConfig,
    options: &CheckOptions,
    scope: LimitScope,
) -> Option<ContentLimitFailure>
where
    C: RateLimitChecker + ?Sized,
{
    match checker.check(request, config, options).await {
        Ok(result) if result.allowed => None,
        Ok(result) => Some(ContentLimitFailure {
            scope,
            status: StatusCode::TOO_MANY_REQUESTS,
            body: FailureBody {
                success: false,
                error: config.message.clone(),
            },
            headers: result.headers(),
        }),
        Err(e) => {
            warn!(
                scope = ?scope,
                key_prefix = %config.key_prefix,
                error = %e,
                "Content rate limit check failed, allowing request"
            );
            if let Some(metrics) = checker.metrics() {
                metrics.record_fail_open();
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RateLimitError, Result};
    use crate::ratelimit::RateLimitResult;
    use crate::store::BackendKind;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;

    /// Records every check and answers from a script of verdicts.
    struct ScriptedChecker {
        calls: Mutex<Vec<(String, Vec<Option<String>>)>>,
        identifiers: Mutex<Vec<Option<String>>>,
        deny_prefix: Option<&'static str>,
        fail: bool,
    }

    impl ScriptedChecker {
        fn allowing() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                identifiers: Mutex::new(Vec::new()),
                deny_prefix: None,
                fail: false,
            }
        }

        fn denying(prefix: &'static str) -> Self {
            Self {
                deny_prefix: Some(prefix),
                ..Self::allowing()
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::allowing()
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl RateLimitChecker for ScriptedChecker {
        async fn check(
            &self,
            _request: &RequestDescriptor,
            config: &RateLimitConfig,
            options: &CheckOptions,
        ) -> Result<RateLimitResult> {
            self.calls
                .lock()
                .push((config.key_prefix.clone(), options.key_parts.clone()));
            self.identifiers.lock().push(options.identifier.clone());
            if self.fail {
                return Err(RateLimitError::Backend("down".to_string()));
            }
            let allowed = self.deny_prefix != Some(config.key_prefix.as_str());
            Ok(RateLimitResult {
                allowed,
                limit: config.max,
                remaining: if allowed { config.max - 1 } else { 0 },
                reset: Utc::now(),
                retry_after: (!allowed).then_some(30),
                backend: BackendKind::Memory,
            })
        }
    }

    fn parts(values: &[&str]) -> Vec<Option<String>> {
        values.iter().map(|v| Some(v.to_string())).collect()
    }

    #[tokio::test]
    async fn test_user_denial_short_circuits() {
        let checker = ScriptedChecker::denying("ai");
        let request = RequestDescriptor::new("/api/content/generate");

        let outcome = enforce_content_rate_limits(
            &checker,
            &request,
            "user-1",
            Some("brand-9"),
            ContentLimitOptions::default(),
        )
        .await;

        let ContentLimitOutcome::Denied(failure) = outcome else {
            panic!("expected a denial");
        };
        assert_eq!(failure.scope, LimitScope::User);
        assert_eq!(failure.status, StatusCode::TOO_MANY_REQUESTS);
        assert!(!failure.body.success);
        assert_eq!(failure.body.error, Policy::AiStandard.preset().message);
        assert_eq!(failure.headers["retry-after"], "30");
        assert_eq!(checker.call_count(), 1);
    }

    #[tokio::test]
    async fn test_brand_layer_uses_user_and_brand_parts() {
        let checker = ScriptedChecker::denying("ai-expensive");
        let request = RequestDescriptor::new("/api/content/generate");

        let outcome = enforce_content_rate_limits(
            &checker,
            &request,
            "user-1",
            Some("brand-9"),
            ContentLimitOptions::default(),
        )
        .await;

        let ContentLimitOutcome::Denied(failure) = outcome else {
            panic!("expected a denial");
        };
        assert_eq!(failure.scope, LimitScope::Brand);

        let calls = checker.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], ("ai".to_string(), parts(&["content", "user", "user-1"])));
        assert_eq!(
            calls[1],
            (
                "ai-expensive".to_string(),
                parts(&["content", "brand", "brand-9", "user-1"])
            )
        );
    }

    #[tokio::test]
    async fn test_without_resource_only_user_layer_runs() {
        let checker = ScriptedChecker::allowing();
        let request = RequestDescriptor::new("/api/content/generate");

        let outcome = enforce_content_rate_limits(
            &checker,
            &request,
            "user-1",
            None,
            ContentLimitOptions::default(),
        )
        .await;

        assert!(outcome.is_allowed());
        assert_eq!(checker.call_count(), 1);
    }

    #[tokio::test]
    async fn test_checker_errors_fail_open() {
        let checker = ScriptedChecker::failing();
        let request = RequestDescriptor::new("/api/content/generate");

        let outcome = enforce_content_rate_limits(
            &checker,
            &request,
            "user-1",
            Some("brand-9"),
            ContentLimitOptions::default(),
        )
        .await;

        assert!(outcome.is_allowed());
        assert_eq!(checker.call_count(), 2);
    }

    #[tokio::test]
    async fn test_custom_policies() {
        let checker = ScriptedChecker::allowing();
        let request = RequestDescriptor::new("/api/content/generate");
        let options = ContentLimitOptions {
            user_policy: Policy::Api,
            resource_policy: Policy::Sensitive,
        };

        enforce_content_rate_limits(&checker, &request, "u", Some("b"), options).await;

        let prefixes: Vec<String> = checker.calls.lock().iter().map(|c| c.0.clone()).collect();
        assert_eq!(prefixes, vec!["api", "sensitive"]);
    }

    #[test]
    fn test_failure_body_shape() {
        let body = FailureBody {
            success: false,
            error: "Too many".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"success": false, "error": "Too many"})
        );
    }

    #[tokio::test]
    async fn test_with_real_limiter_brand_quota_is_per_user() {
        use crate::ratelimit::RateLimiter;
        use crate::store::MemoryStore;
        use std::sync::Arc;

        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let request = RequestDescriptor::new("/api/content/generate");
        let options = ContentLimitOptions::default();
        let brand_max = Policy::AiExpensive.preset().max;

        for _ in 0..brand_max {
            let outcome =
                enforce_content_rate_limits(&limiter, &request, "alice", Some("acme"), options)
                    .await;
            assert!(outcome.is_allowed());
        }
        let outcome =
            enforce_content_rate_limits(&limiter, &request, "alice", Some("acme"), options).await;
        assert!(matches!(
            outcome,
            ContentLimitOutcome::Denied(ContentLimitFailure { scope: LimitScope::Brand, .. })
        ));

        // Another user of the same brand has an untouched budget.
        let outcome =
            enforce_content_rate_limits(&limiter, &request, "bob", Some("acme"), options).await;
        assert!(outcome.is_allowed());
    }

    #[tokio::test]
    async fn test_user_ceiling_holds_across_addresses() {
        use crate::ratelimit::{RateLimiter, FORWARDED_FOR};
        use crate::store::MemoryStore;
        use std::sync::Arc;

        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let options = ContentLimitOptions::default();
        let user_max = Policy::AiStandard.preset().max;

        let mut denied = Vec::new();
        for i in 0..user_max + 5 {
            let request = RequestDescriptor::new("/api/content/generate")
                .with_header(FORWARDED_FOR, &format!("203.0.113.{}", i));
            let outcome =
                enforce_content_rate_limits(&limiter, &request, "alice", None, options).await;
            if let ContentLimitOutcome::Denied(failure) = outcome {
                denied.push((i, failure.scope));
            }
        }

        assert_eq!(denied.len(), 5);
        assert_eq!(denied[0], (user_max, LimitScope::User));
    }

    #[tokio::test]
    async fn test_layers_identify_by_user() {
        let checker = ScriptedChecker::allowing();
        let request = RequestDescriptor::new("/api/content/generate")
            .with_header("x-forwarded-for", "198.51.100.7");

        enforce_content_rate_limits(
            &checker,
            &request,
            "user-1",
            Some("brand-9"),
            ContentLimitOptions::default(),
        )
        .await;

        let identifiers = checker.identifiers.lock().clone();
        assert_eq!(identifiers, vec![Some("user-1".to_string()); 2]);
    }
}
