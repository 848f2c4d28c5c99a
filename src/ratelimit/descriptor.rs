//! Request descriptors and rate limit key construction.

use http::{HeaderMap, HeaderName, HeaderValue};

/// Header carrying the proxy chain, client first.
pub const FORWARDED_FOR: &str = "x-forwarded-for";
/// Header carrying the client address set by a single proxy.
pub const REAL_IP: &str = "x-real-ip";
/// Header carrying the authenticated user id.
pub const USER_ID: &str = "x-user-id";

/// Identity used when nothing better is known about the caller.
const UNKNOWN_IDENTITY: &str = "unknown";

/// What the limiter needs to know about an inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestDescriptor {
    path: String,
    headers: HeaderMap,
}

impl RequestDescriptor {
    /// Create a descriptor for the given request path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Add a header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    /// The request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Look up a header as trimmed, non-empty text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Derive a caller identity from network headers.
    ///
    /// First forwarded address, then the real-ip header, then `unknown`.
    /// A user id header narrows the identity to `<ip>:<user>`.
    pub fn client_identity(&self) -> String {
        let ip = self
            .header(FORWARDED_FOR)
            .and_then(|chain| chain.split(',').map(str::trim).find(|ip| !ip.is_empty()))
            .or_else(|| self.header(REAL_IP))
            .unwrap_or(UNKNOWN_IDENTITY);

        match self.header(USER_ID) {
            Some(user) => format!("{}:{}", ip, user),
            None => ip.to_string(),
        }
    }
}

/// A fully qualified rate limit key.
///
/// Format: `<namespace>:<prefix>:<part>:...:<identifier>`. Parts are
/// sanitized so that a stray colon cannot make two scopes collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Build a key from its components, skipping absent or blank parts.
    pub fn new<S: AsRef<str>>(
        namespace: &str,
        prefix: &str,
        parts: &[Option<S>],
        identifier: &str,
    ) -> Self {
        let mut segments = vec![namespace.to_string(), prefix.to_string()];
        segments.extend(
            parts
                .iter()
                .flatten()
                .map(|part| sanitize_part(part.as_ref()))
                .filter(|part| !part.is_empty()),
        );
        segments.push(identifier.to_string());
        Self(segments.join(":"))
    }

    /// The key as stored in the backend.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Replace colons and collapse whitespace runs into single dashes.
fn sanitize_part(part: &str) -> String {
    part.replace(':', "-")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}
