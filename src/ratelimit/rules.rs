//! Named rate limit policies and request path classification.
//!
//! Each [`Policy`] carries two independently tuned tables: the simple limits
//! used by the path-classified policy wrapper, and the stricter full-fidelity
//! presets used by call sites that want the complete verdict (such as the
//! content generation facade).

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::limiter::RateLimitConfig;
use crate::error::RateLimitError;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// AI tools expensive enough to get the tighter budget.
const EXPENSIVE_TOOLS: &[&str] = &[
    "content-transcreator",
    "metadata-generator",
    "alt-text-generator",
];

/// A named rate limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// Login and other authentication endpoints
    Auth,
    /// Heavy AI tools such as transcreation
    AiExpensive,
    /// Lighter AI tools and content generation
    AiStandard,
    /// Generic catch-all for API routes
    Api,
    /// User management and destructive brand operations
    Sensitive,
}

/// A simple `{requests, window, message}` policy definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyLimits {
    /// Requests allowed per window
    pub requests: u32,
    /// Window length
    pub window: Duration,
    /// Message shown when the policy refuses a request
    pub message: &'static str,
}

impl Policy {
    /// Every policy, in declaration order.
    pub const ALL: [Policy; 5] = [
        Policy::Auth,
        Policy::AiExpensive,
        Policy::AiStandard,
        Policy::Api,
        Policy::Sensitive,
    ];

    /// The policy's name.
    pub fn name(&self) -> &'static str {
        match self {
            Policy::Auth => "auth",
            Policy::AiExpensive => "ai-expensive",
            Policy::AiStandard => "ai-standard",
            Policy::Api => "api",
            Policy::Sensitive => "sensitive",
        }
    }

    /// Limits used by the path-classified policy wrapper.
    pub fn limits(&self) -> PolicyLimits {
        match self {
            Policy::Auth => PolicyLimits {
                requests: 20,
                window: 15 * MINUTE,
                message: "Too many authentication attempts. Please try again in 15 minutes.",
            },
            Policy::AiExpensive => PolicyLimits {
                requests: 30,
                window: 5 * MINUTE,
                message: "Too many requests to this AI tool. Please try again in a few minutes.",
            },
            Policy::AiStandard => PolicyLimits {
                requests: 60,
                window: MINUTE,
                message: "Too many AI requests. Please wait a moment before trying again.",
            },
            Policy::Api => PolicyLimits {
                requests: 600,
                window: MINUTE,
                message: "Too many requests. Please slow down.",
            },
            Policy::Sensitive => PolicyLimits {
                requests: 50,
                window: HOUR,
                message: "Too many sensitive operations. Please try again later.",
            },
        }
    }

    /// The simple limits as a full configuration, keyed `simple-<name>`.
    pub fn config(&self) -> RateLimitConfig {
        let limits = self.limits();
        RateLimitConfig::new(
            limits.window,
            limits.requests,
            format!("simple-{}", self.name()),
            limits.message,
        )
    }

    /// The full-fidelity preset for this category.
    pub fn preset(&self) -> RateLimitConfig {
        match self {
            Policy::Auth => RateLimitConfig::new(
                15 * MINUTE,
                5,
                "auth",
                "Too many authentication attempts. Please try again in 15 minutes.",
            ),
            Policy::AiStandard => RateLimitConfig::new(
                MINUTE,
                20,
                "ai",
                "Too many AI generation requests. Please wait a minute before trying again.",
            ),
            Policy::AiExpensive => RateLimitConfig::new(
                5 * MINUTE,
                10,
                "ai-expensive",
                "You have reached the limit for this brand. Please try again in a few minutes.",
            ),
            Policy::Api => RateLimitConfig::new(
                MINUTE,
                100,
                "api",
                "Too many requests. Please slow down.",
            ),
            Policy::Sensitive => RateLimitConfig::new(
                HOUR,
                10,
                "sensitive",
                "Too many sensitive operations. Please try again in an hour.",
            ),
        }
    }
}

impl std::fmt::Display for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Policy {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Policy::ALL
            .into_iter()
            .find(|p| p.name() == wanted)
            .ok_or_else(|| RateLimitError::Config(format!("unknown rate limit policy: {}", s)))
    }
}

/// Pick the policy for a request path.
///
/// Matching is case-insensitive and a missing leading slash is tolerated.
/// Anything outside `/api/` gets the generic policy.
pub fn classify_path(path: &str) -> Policy {
    let lower = path.trim().to_ascii_lowercase();
    let path = if lower.starts_with('/') {
        lower
    } else {
        format!("/{}", lower)
    };

    if !path.starts_with("/api/") {
        return Policy::Api;
    }

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    if segments.contains(&"auth") {
        return Policy::Auth;
    }

    if let Some(tool) = path.strip_prefix("/api/tools/") {
        let tool = tool.split('/').next().unwrap_or_default();
        if EXPENSIVE_TOOLS.contains(&tool) {
            return Policy::AiExpensive;
        }
        return Policy::AiStandard;
    }

    if path.starts_with("/api/ai/") || path.starts_with("/api/content/generate") {
        return Policy::AiStandard;
    }

    if matches!(segments.get(1), Some(&"users") | Some(&"admin")) {
        return Policy::Sensitive;
    }

    if segments.get(1) == Some(&"brands") && segments.contains(&"delete") {
        return Policy::Sensitive;
    }

    Policy::Api
}
