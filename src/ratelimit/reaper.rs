//! Background eviction of expired window state.
//!
//! The reaper is a tokio task that wakes on a fixed interval, takes the
//! limiter's lock and drops every key whose window has ended. It races each
//! tick against a one-shot termination signal and always prefers the signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::window::WindowState;
use crate::error::{Result, TallyError};

/// Window state shared between a limiter and its reaper.
pub(crate) type SharedWindows = Arc<Mutex<HashMap<String, WindowState>>>;

/// Lifecycle of a limiter's background reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaperState {
    /// Waiting for the next tick or sweeping.
    Running,
    /// Terminated. This state is final.
    Stopped,
}

/// Outcome of a single eviction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sweep {
    pub evicted: usize,
    pub remaining: usize,
}

/// Remove every entry whose window ended at or before `now`.
pub(crate) fn sweep(windows: &Mutex<HashMap<String, WindowState>>, now: Instant) -> Sweep {
    let mut windows = windows.lock();
    let before = windows.len();
    windows.retain(|_, state| !state.is_expired(now));

    Sweep {
        evicted: before - windows.len(),
        remaining: windows.len(),
    }
}

/// Handle to a running reaper task.
pub(crate) struct Reaper {
    /// Termination signal; flips from `false` to `true` exactly once.
    shutdown_tx: watch::Sender<bool>,
    /// Taken by the first caller that waits for the task to finish.
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reaper {
    /// Spawn a reaper on the current tokio runtime.
    pub(crate) fn spawn(windows: SharedWindows, interval: Duration) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| TallyError::NoRuntime)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = runtime.spawn(run(windows, interval, shutdown_rx));

        Ok(Self {
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Fire the termination signal.
    ///
    /// Returns `false` if the signal had already been fired.
    pub(crate) fn signal(&self) -> bool {
        self.shutdown_tx.send_if_modified(|stopped| {
            if *stopped {
                return false;
            }
            *stopped = true;
            true
        })
    }

    pub(crate) fn is_signalled(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// The task holds the only receiver, so it is gone once the task is.
    pub(crate) fn state(&self) -> ReaperState {
        if self.shutdown_tx.receiver_count() == 0 {
            ReaperState::Stopped
        } else {
            ReaperState::Running
        }
    }

    /// Wait for the task to exit. Only the first caller actually waits.
    pub(crate) async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Reaper task did not finish cleanly");
            }
        }
    }
}

/// The reaper loop.
///
/// The first sweep happens one full interval after start.
pub(crate) async fn run(
    windows: SharedWindows,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(interval = ?period, "Reaper started");

    loop {
        tokio::select! {
            biased;

            signalled = stop_requested(&mut shutdown_rx) => {
                if !signalled {
                    debug!("Reaper signal dropped with its limiter");
                }
                break;
            }
            _ = ticker.tick() => {
                let result = sweep(&windows, Instant::now());
                if result.evicted > 0 {
                    debug!(
                        evicted = result.evicted,
                        remaining = result.remaining,
                        "Evicted expired rate limit windows"
                    );
                } else {
                    trace!(remaining = result.remaining, "Reaper pass found nothing to evict");
                }
            }
        }
    }

    debug!("Reaper stopped");
}

/// Resolves once termination is requested (`true`) or the sender is gone (`false`).
async fn stop_requested(shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    shutdown_rx.wait_for(|stopped| *stopped).await.is_ok()
}
