//! Coalesced warnings for dropped telemetry.
//!
//! Producers may shed thousands of items per second when the queue is full.
//! Logging each drop would swamp the application's own logs, so callers
//! increment a counter and emit a single summary once per interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default interval between drop summaries.
pub const DEFAULT_WARN_INTERVAL: Duration = Duration::from_secs(5);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or_default()
}

/// Helper that rate limits dropped-item warnings.
///
/// The caller increments the drop counter via [`record_drop`](Self::record_drop).
/// The next call to [`warn_if_due`](Self::warn_if_due) emits a warning using
/// the provided callback if the configured interval has elapsed.
/// [`flush`](Self::flush) emits a warning immediately if anything has been
/// dropped since the last emission.
#[derive(Debug)]
pub struct RateLimitedWarner {
    interval_ms: u64,
    last_warn: AtomicU64,
    dropped: AtomicU64,
}

impl Default for RateLimitedWarner {
    fn default() -> Self {
        Self::new(DEFAULT_WARN_INTERVAL)
    }
}

impl RateLimitedWarner {
    /// Create a new warner. The first warning can be emitted immediately.
    pub fn new(interval: Duration) -> Self {
        let interval_ms = interval.as_millis().min(u128::from(u64::MAX)) as u64;
        Self {
            interval_ms,
            last_warn: AtomicU64::new(now_millis().saturating_sub(interval_ms)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Increment the dropped-item counter.
    pub fn record_drop(&self) {
        self.record_drops(1);
    }

    /// Increment the dropped-item counter by `count`.
    pub fn record_drops(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Emit a warning if the rate limit interval has elapsed.
    pub fn warn_if_due(&self, mut warn: impl FnMut(u64)) {
        let now = now_millis();
        let prev = self.last_warn.load(Ordering::Relaxed);
        if now.saturating_sub(prev) < self.interval_ms {
            return;
        }
        if self
            .last_warn
            .compare_exchange(prev, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            // Another thread won the race and will report the backlog.
            return;
        }
        let count = self.dropped.swap(0, Ordering::Relaxed);
        if count > 0 {
            warn(count);
        }
    }

    /// Immediately warn about any dropped items.
    pub fn flush(&self, mut warn: impl FnMut(u64)) {
        let count = self.dropped.swap(0, Ordering::Relaxed);
        if count > 0 {
            warn(count);
            self.last_warn.store(now_millis(), Ordering::Relaxed);
        }
    }

    /// Number of drops not yet reported.
    pub fn pending(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
