//! HTTP header projection of rate limit verdicts.

use chrono::{DateTime, SecondsFormat, Utc};
use http::header::RETRY_AFTER;
use http::{HeaderMap, HeaderName, HeaderValue};

/// Maximum requests allowed in the window.
pub static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Requests remaining in the current window.
pub static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// ISO-8601 instant when the window (or block) ends.
pub static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Build the standard rate limit headers.
///
/// `Retry-After` is only present when `retry_after` is.
pub fn rate_limit_headers(
    limit: u32,
    remaining: u32,
    reset: DateTime<Utc>,
    retry_after: Option<u64>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(limit));
    headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(remaining));
    if let Ok(value) = HeaderValue::from_str(&reset.to_rfc3339_opts(SecondsFormat::Millis, true)) {
        headers.insert(X_RATELIMIT_RESET.clone(), value);
    }
    if let Some(seconds) = retry_after {
        headers.insert(RETRY_AFTER, HeaderValue::from(seconds));
    }
    headers
}

/// Flatten headers into name/value pairs, e.g. for JSON output.
pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_headers_without_retry() {
        let reset = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let headers = rate_limit_headers(60, 59, reset, None);

        assert_eq!(headers["x-ratelimit-limit"], "60");
        assert_eq!(headers["X-RateLimit-Remaining"], "59");
        assert_eq!(headers["x-ratelimit-reset"], "2026-01-02T03:04:05.000Z");
        assert!(headers.get(RETRY_AFTER).is_none());
    }

    #[test]
    fn test_headers_with_retry() {
        let reset = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let headers = rate_limit_headers(5, 0, reset, Some(42));
        assert_eq!(headers["retry-after"], "42");
        assert_eq!(header_pairs(&headers).len(), 4);
    }
}
