//! Rate limit counter records and window arithmetic.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Violations tolerated before a key is blocked outright.
pub const VIOLATIONS_BEFORE_BLOCK: u32 = 3;

/// Upper bound on a single block period.
pub const MAX_BLOCK_DURATION: Duration = Duration::from_secs(3600);

/// Shortest TTL ever written to the remote store.
const MIN_TTL_MS: i64 = 1000;

/// The persisted counter state for one rate limit key.
///
/// Timestamps are epoch milliseconds so the JSON form stays compatible with
/// records written by other services sharing the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitEntry {
    /// Requests admitted in the current window
    pub count: u32,
    /// When the current window ends
    pub reset_time: i64,
    /// Whether a penalty block has been imposed
    #[serde(default)]
    pub blocked: bool,
    /// When the penalty block ends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_until: Option<i64>,
    /// Requests refused since the key was last clean
    #[serde(default)]
    pub violations: u32,
}

impl RateLimitEntry {
    /// A fresh window starting at `now`.
    pub fn fresh(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 0,
            reset_time: now.timestamp_millis() + window_millis(window),
            blocked: false,
            block_until: None,
            violations: 0,
        }
    }

    /// The window has run out.
    pub fn window_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() >= self.reset_time
    }

    /// A block is in force at `now`.
    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.blocked
            && self
                .block_until
                .is_some_and(|until| until > now.timestamp_millis())
    }

    /// Bring a loaded record up to date with `now`.
    ///
    /// An expired window with no block history starts over. A block that is
    /// still in force survives rollover, and a lapsed block clears its flag
    /// but keeps the violation count so repeat offenders escalate.
    pub fn roll(self, now: DateTime<Utc>, window: Duration) -> Self {
        let active_block = self.is_blocked(now);
        let mut entry = self;

        if entry.window_expired(now) {
            if !entry.blocked {
                return Self::fresh(now, window);
            }
            entry.count = 0;
            entry.reset_time = now.timestamp_millis() + window_millis(window);
        }

        if entry.blocked && !active_block {
            entry.blocked = false;
            entry.block_until = None;
        }

        entry
    }

    /// Record a refused request, escalating into a block when warranted.
    ///
    /// Returns the block duration when one was imposed.
    pub fn record_violation(&mut self, now: DateTime<Utc>, window: Duration) -> Option<Duration> {
        self.violations = self.violations.saturating_add(1);
        let duration = block_duration(window, self.violations)?;
        self.blocked = true;
        self.block_until = Some(now.timestamp_millis() + duration.as_millis() as i64);
        Some(duration)
    }

    /// The instant a refused caller may retry.
    pub fn retry_at(&self) -> i64 {
        match (self.blocked, self.block_until) {
            (true, Some(until)) => until,
            _ => self.reset_time,
        }
    }

    /// TTL to use when writing this record to the remote store.
    pub fn ttl_secs(&self, now: DateTime<Utc>) -> u64 {
        let expires_at = self.block_until.unwrap_or(self.reset_time).max(self.reset_time);
        let remaining = (expires_at - now.timestamp_millis()).max(MIN_TTL_MS);
        ((remaining + 999) / 1000) as u64
    }
}

/// Block length for the given violation count.
///
/// Nothing below [`VIOLATIONS_BEFORE_BLOCK`]; then one window, doubling with
/// each further violation, capped at [`MAX_BLOCK_DURATION`].
pub fn block_duration(window: Duration, violations: u32) -> Option<Duration> {
    if violations < VIOLATIONS_BEFORE_BLOCK {
        return None;
    }
    let exponent = violations - VIOLATIONS_BEFORE_BLOCK;
    let multiplier = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    let scaled = window.checked_mul(multiplier).unwrap_or(MAX_BLOCK_DURATION);
    Some(scaled.min(MAX_BLOCK_DURATION))
}

/// Whole seconds from `now` until `at_ms`, rounded up.
pub fn seconds_until(now: DateTime<Utc>, at_ms: i64) -> u64 {
    let delta = at_ms - now.timestamp_millis();
    if delta <= 0 {
        0
    } else {
        ((delta + 999) / 1000) as u64
    }
}

/// Convert epoch milliseconds into a UTC timestamp.
pub fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}
