//! Shared fixed-window rate limiter.
//!
//! One window per identifier.  When a window lapses, the next increment
//! resets the count to 1 and advances the window end by the configured
//! width.  Used by the subscriber hub for per-connection event budgets and
//! by admin surfaces for per-identifier limits.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Result of one increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateStatus {
    /// Events counted in the current window, including this one.
    pub count: u32,
    /// When the current window ends.
    pub reset_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct RateState {
    count: u32,
    window_end: Instant,
}

/// Thread-safe per-identifier window counters.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, RateState>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter::default()
    }

    /// Count one event against `identifier` in a window of `window` width.
    pub fn increment(&self, identifier: &str, window: Duration) -> RateStatus {
        self.increment_at(identifier, window, Instant::now())
    }

    /// Clock-injected variant of [`RateLimiter::increment`].
    pub fn increment_at(&self, identifier: &str, window: Duration, now: Instant) -> RateStatus {
        let mut windows = self.windows.lock().unwrap();
        let state = windows
            .entry(identifier.to_owned())
            .or_insert_with(|| RateState {
                count: 0,
                window_end: now + window,
            });
        if now >= state.window_end {
            state.count = 1;
            state.window_end = now + window;
        } else {
            state.count += 1;
        }
        RateStatus {
            count: state.count,
            reset_at: state.window_end,
        }
    }

    /// Drop the window for an identifier (e.g. on disconnect).
    pub fn forget(&self, identifier: &str) {
        self.windows.lock().unwrap().remove(identifier);
    }

    /// Remove all windows that ended before `now`.
    pub fn prune(&self, now: Instant) {
        self.windows
            .lock()
            .unwrap()
            .retain(|_, state| state.window_end > now);
    }
}
