//! Rate limiting logic and policies.

mod backend;
mod content;
mod descriptor;
mod entry;
mod headers;
mod limiter;
mod policy;
mod rules;

pub use backend::RateLimitChecker;
pub use content::{
    enforce_content_rate_limits, ContentLimitFailure, ContentLimitOptions, ContentLimitOutcome,
    FailureBody, LimitScope,
};
pub use descriptor::{RateLimitKey, RequestDescriptor, FORWARDED_FOR, REAL_IP, USER_ID};
pub use entry::{block_duration, RateLimitEntry, MAX_BLOCK_DURATION, VIOLATIONS_BEFORE_BLOCK};
pub use headers::{header_pairs, rate_limit_headers};
pub use limiter::{CheckOptions, RateLimitConfig, RateLimitResult, RateLimiter, DEFAULT_NAMESPACE};
pub use policy::{check_policy, check_request, PolicyVerdict, DEGRADED_MESSAGE};
pub use rules::{classify_path, Policy, PolicyLimits};
