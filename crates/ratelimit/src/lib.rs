//! Rate limiters for shaping outbound mail delivery.
//!
//! Two designs are provided for two different workloads: a token
//! bucket for the bursty mix of single sends handled by the
//! dispatcher, and a sliding window for bulk campaign delivery, where
//! the provider quota is an exact "no more than N per window" cap
//! that a bucket's burst allowance could momentarily violate.
//!
//! Both limiters offer a non-blocking `allow` and an async `wait`.
//! `wait` holds no locks across suspension points and records the
//! slot only once it is actually granted, so it is safe to cancel by
//! dropping the future (for example from inside a `tokio::select!`
//! arm racing against shutdown).

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub mod bucket;
pub use bucket::TokenBucket;

/// An exact count of send timestamps in a trailing window.
///
/// `limit` sends are admitted per `window`; the next slot opens when
/// the oldest recorded timestamp ages out. The limit can be adjusted
/// while the limiter is in use, and the limiter can be disabled
/// entirely, in which case every request is admitted.
pub struct SlidingWindow {
    state: Mutex<WindowState>,
}

struct WindowState {
    window: Duration,
    limit: usize,
    enabled: bool,
    stamps: VecDeque<Instant>,
}

impl WindowState {
    /// Drop timestamps that have aged out of the window.
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.stamps.front() {
            if now.duration_since(oldest) >= self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Either record a send at `now`, or report how long until the
    /// next slot could open up.
    fn acquire(&mut self, now: Instant) -> Result<(), Duration> {
        if !self.enabled {
            return Ok(());
        }
        self.prune(now);
        if self.stamps.len() < self.limit {
            self.stamps.push_back(now);
            return Ok(());
        }
        let oldest = *self.stamps.front().expect("limit > 0 implies non-empty");
        Err((oldest + self.window).saturating_duration_since(now))
    }
}

impl SlidingWindow {
    pub fn new(window: Duration, limit: usize) -> Self {
        Self {
            state: Mutex::new(WindowState {
                window,
                limit: limit.max(1),
                enabled: true,
                stamps: VecDeque::with_capacity(limit.max(1)),
            }),
        }
    }

    /// Non-blocking check-and-record: admit and record a send now, or
    /// return false without consuming anything.
    pub fn allow(&self) -> bool {
        self.state.lock().acquire(Instant::now()).is_ok()
    }

    /// Block until a send is admitted. Cancel-safe: dropping the
    /// future before it resolves does not consume a slot.
    pub async fn wait(&self) {
        loop {
            let delay = match self.state.lock().acquire(Instant::now()) {
                Ok(()) => return,
                Err(delay) => delay,
            };
            tokio::time::sleep(delay).await;
        }
    }

    /// Adjust the per-window cap. Takes effect on the next acquire;
    /// already-recorded timestamps are kept.
    pub fn set_limit(&self, limit: usize) {
        self.state.lock().limit = limit.max(1);
    }

    /// When disabled, every request is admitted and nothing is
    /// recorded.
    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    /// Returns (sends currently counted in the window, limit).
    pub fn stats(&self) -> (usize, usize) {
        let mut state = self.state.lock();
        state.prune(Instant::now());
        (state.stamps.len(), state.limit)
    }
}
