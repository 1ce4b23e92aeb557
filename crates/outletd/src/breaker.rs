//! Circuit breaker guarding the outbound transport. When the provider
//! starts refusing everything there is no point hammering it; we stop
//! attempting, wait out a cooldown, and probe with a single send.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let label = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        };
        fmt.write_str(label)
    }
}

/// Outcome of [`CircuitBreaker::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Defer,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// In half-open, set once the single probe has been handed out.
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Ask whether a send may be attempted right now. Performs the
    /// open -> half-open transition once the cooldown has elapsed;
    /// half-open admits exactly one probe until its outcome lands.
    pub fn check(&self) -> Decision {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Decision::Proceed,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed < self.cooldown {
                    return Decision::Defer;
                }
                tracing::info!("circuit breaker half-open, probing delivery");
                inner.state = BreakerState::HalfOpen;
                inner.probe_in_flight = true;
                Decision::Proceed
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Decision::Defer
                } else {
                    inner.probe_in_flight = true;
                    Decision::Proceed
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state != BreakerState::Closed {
            tracing::info!("circuit breaker closed, delivery recovered");
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
        }
    }

    /// Returns true when this failure newly opened the breaker.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.probe_in_flight = false;
        match inner.state {
            BreakerState::Closed if inner.consecutive_failures >= self.threshold => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                true
            }
            // A failed probe re-opens and restarts the cooldown.
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Current state without triggering any transition; used by the
    /// batch fetcher to skip polling while the breaker is open.
    pub fn current(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_failure();
        assert_equal!(breaker.current(), BreakerState::Closed);
        assert_equal!(breaker.check(), Decision::Proceed);

        assert!(breaker.record_failure());
        assert_equal!(breaker.current(), BreakerState::Open);
        assert_equal!(breaker.check(), Decision::Defer);
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        // The counter starts over.
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());
    }

    #[test]
    fn cooldown_admits_exactly_one_probe() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));
        assert!(breaker.record_failure());
        assert_equal!(breaker.check(), Decision::Defer);

        std::thread::sleep(Duration::from_millis(30));
        assert_equal!(breaker.check(), Decision::Proceed);
        assert_equal!(breaker.current(), BreakerState::HalfOpen);
        // Only one probe until its outcome is recorded.
        assert_equal!(breaker.check(), Decision::Defer);

        breaker.record_success();
        assert_equal!(breaker.current(), BreakerState::Closed);
        assert_equal!(breaker.check(), Decision::Proceed);
    }

    #[test]
    fn failed_probe_reopens_and_restarts_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert_equal!(breaker.check(), Decision::Proceed);

        assert!(breaker.record_failure());
        assert_equal!(breaker.current(), BreakerState::Open);
        assert_equal!(breaker.check(), Decision::Defer);
    }
}
