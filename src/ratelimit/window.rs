//! Fixed window state for a single key.

use std::time::Duration;
use tokio::time::Instant;

/// Upper bound for a window end when `now + window` overflows the clock.
const MAX_WINDOW: Duration = Duration::from_secs(30 * 365 * 86_400);

/// Counting state for one key's current fixed window.
///
/// A window covers the half-open interval `[expires_at - window, expires_at)`.
/// A request arriving exactly at `expires_at` belongs to the next window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Admissions recorded in the current window
    count: u64,
    /// End of the current window (exclusive)
    expires_at: Instant,
}

impl WindowState {
    /// Open a fresh window starting at `now`.
    pub fn new(now: Instant, window: Duration) -> Self {
        Self {
            count: 0,
            expires_at: window_end(now, window),
        }
    }

    /// Get the number of admissions in this window.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Get the instant at which this window ends.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Whether the window has ended as of `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    /// Get the remaining quota for `limit`.
    pub fn remaining(&self, limit: u64) -> u64 {
        limit.saturating_sub(self.count)
    }

    /// Get the duration until this window ends.
    pub fn duration_until_reset(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// Replace this window with a fresh one starting at `now`.
    pub(crate) fn reset(&mut self, now: Instant, window: Duration) {
        *self = Self::new(now, window);
    }

    /// Record one admission if the window has quota left under `limit`.
    ///
    /// Returns `false` without touching the count when the limit is reached.
    pub(crate) fn try_admit(&mut self, limit: u64) -> bool {
        if self.count >= limit {
            return false;
        }
        self.count += 1;
        true
    }

    #[cfg(test)]
    pub(crate) fn with_count(count: u64, expires_at: Instant) -> Self {
        Self { count, expires_at }
    }
}

fn window_end(now: Instant, window: Duration) -> Instant {
    now.checked_add(window).unwrap_or_else(|| now + MAX_WINDOW)
}
