//! Core rate limiter implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::reaper::{sweep, Reaper, ReaperState, SharedWindows};
use super::window::WindowState;
use crate::config::LimiterConfig;
use crate::error::{Result, TallyError};

/// A per-key fixed-window rate limiter.
///
/// All window state lives in one map behind one lock. Admission checks hold
/// the lock for a single O(1) update; the background reaper holds it for one
/// O(keys) eviction pass every cleanup interval.
///
/// Each limiter owns its own state and reaper task. Call [`Limiter::close`]
/// (or [`Limiter::shutdown`]) when done with it; dropping the limiter also
/// stops the reaper.
pub struct Limiter {
    /// Window state indexed by key
    windows: SharedWindows,
    /// Background eviction task
    reaper: Reaper,
    /// How often the reaper runs
    cleanup_interval: Duration,
}

impl Limiter {
    /// Create a new limiter and start its reaper.
    ///
    /// Must be called from within a tokio runtime. A zero `cleanup_interval`
    /// is rejected with [`TallyError::InvalidCleanupInterval`].
    pub fn new(cleanup_interval: Duration) -> Result<Self> {
        if cleanup_interval.is_zero() {
            return Err(TallyError::InvalidCleanupInterval);
        }

        let windows: SharedWindows = Arc::new(Mutex::new(HashMap::new()));
        let reaper = Reaper::spawn(Arc::clone(&windows), cleanup_interval)?;

        info!(cleanup_interval = ?cleanup_interval, "Rate limiter started");

        Ok(Self {
            windows,
            reaper,
            cleanup_interval,
        })
    }

    /// Create a new limiter from configuration.
    pub fn with_config(config: &LimiterConfig) -> Result<Self> {
        Self::new(config.cleanup_interval())
    }

    /// Decide whether a request for `key` is admitted.
    ///
    /// Admits at most `limit` requests per `window` for each key. When the
    /// key's window has ended (at or before now) it is replaced by a fresh
    /// one starting now. Rejections leave the count untouched. `limit` and
    /// `window` apply to this call only, so callers should keep them
    /// constant for a given key.
    ///
    /// This never blocks beyond the lock and keeps working after
    /// [`Limiter::close`].
    pub fn allow(&self, key: &str, limit: u64, window: Duration) -> bool {
        let now = Instant::now();

        let (admitted, count) = {
            let mut windows = self.windows.lock();

            match windows.get_mut(key) {
                Some(state) => {
                    if state.is_expired(now) {
                        debug!(
                            key = %key,
                            window = ?window,
                            previous_count = state.count(),
                            "Window expired, starting a new one"
                        );
                        state.reset(now, window);
                    }
                    (state.try_admit(limit), state.count())
                }
                None => {
                    debug!(key = %key, window = ?window, "Tracking new rate limit key");
                    let mut state = WindowState::new(now, window);
                    let admitted = state.try_admit(limit);
                    let count = state.count();
                    windows.insert(key.to_owned(), state);
                    (admitted, count)
                }
            }
        };

        trace!(
            key = %key,
            limit = limit,
            count = count,
            admitted = admitted,
            "Checked rate limit"
        );

        if !admitted {
            debug!(key = %key, limit = limit, "Rate limit exceeded");
        }

        admitted
    }

    /// Stop the reaper.
    ///
    /// Window state is kept and [`Limiter::allow`] keeps working. Closing an
    /// already closed limiter is a no-op: it returns `false` and leaves the
    /// termination signal as it was.
    pub fn close(&self) -> bool {
        if self.reaper.signal() {
            info!("Rate limiter closed");
            true
        } else {
            debug!("Rate limiter already closed");
            false
        }
    }

    /// Close the limiter and wait for the reaper task to exit.
    pub async fn shutdown(&self) {
        self.close();
        self.reaper.join().await;
    }

    /// Whether [`Limiter::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.reaper.is_signalled()
    }

    /// Get the state of the background reaper.
    pub fn reaper_state(&self) -> ReaperState {
        self.reaper.state()
    }

    /// Run one eviction pass now, returning the number of evicted keys.
    pub fn evict_expired(&self) -> usize {
        sweep(&self.windows, Instant::now()).evicted
    }

    /// Get the number of admissions in the key's current window.
    ///
    /// Returns `None` if the key is not tracked or its window has ended.
    pub fn current_count(&self, key: &str) -> Option<u64> {
        self.window_state(key).map(|state| state.count())
    }

    /// Get a snapshot of the key's current window.
    ///
    /// Returns `None` if the key is not tracked or its window has ended.
    pub fn window_state(&self, key: &str) -> Option<WindowState> {
        let now = Instant::now();
        let windows = self.windows.lock();
        windows
            .get(key)
            .filter(|state| !state.is_expired(now))
            .copied()
    }

    /// Get the number of tracked keys, including expired ones not yet evicted.
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }

    /// Clear all window state.
    pub fn clear(&self) {
        self.windows.lock().clear();
    }

    /// Get the reaper's cleanup interval.
    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("cleanup_interval", &self.cleanup_interval)
            .field("tracked_keys", &self.tracked_keys())
            .field("reaper", &self.reaper_state())
            .finish()
    }
}
