//! Counters for rate limit decisions.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Decision counters shared by a limiter and the layers above it.
#[derive(Debug, Default)]
pub struct RateLimitMetrics {
    allowed: AtomicU64,
    blocked: AtomicU64,
    violations: AtomicU64,
    blocks_imposed: AtomicU64,
    fail_open: AtomicU64,
}

/// A point-in-time copy of [`RateLimitMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests admitted
    pub allowed: u64,
    /// Requests refused because the key was under a block
    pub blocked: u64,
    /// Requests refused because the window was full
    pub violations: u64,
    /// Blocks imposed after repeated violations
    pub blocks_imposed: u64,
    /// Requests admitted because the limiter itself failed
    pub fail_open: u64,
}

impl RateLimitMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an admitted request.
    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request refused by an active block.
    pub fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a violation, and a new block when one was imposed.
    pub fn record_violation(&self, imposed_block: bool) {
        self.violations.fetch_add(1, Ordering::Relaxed);
        if imposed_block {
            self.blocks_imposed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a request admitted because the check itself failed.
    pub fn record_fail_open(&self) {
        self.fail_open.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            violations: self.violations.load(Ordering::Relaxed),
            blocks_imposed: self.blocks_imposed.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_records() {
        let metrics = RateLimitMetrics::new();
        metrics.record_allowed();
        metrics.record_allowed();
        metrics.record_violation(false);
        metrics.record_violation(true);
        metrics.record_blocked();
        metrics.record_fail_open();

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                allowed: 2,
                blocked: 1,
                violations: 2,
                blocks_imposed: 1,
                fail_open: 1,
            }
        );
    }
}
