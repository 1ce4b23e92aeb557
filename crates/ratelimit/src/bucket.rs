//! Token bucket limiter: tokens accrue continuously at `rate` per
//! second up to a `burst` cap, and each send consumes one.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

pub struct TokenBucket {
    state: Mutex<BucketState>,
}

struct BucketState {
    /// Tokens added per second.
    rate: f64,
    /// Maximum tokens that may accumulate.
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last = now;
    }

    fn acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let deficit = 1.0 - self.tokens;
        // A rate at or near zero makes the delay overflow Duration;
        // report an unbounded wait rather than panicking.
        Err(Duration::try_from_secs_f64(deficit / self.rate).unwrap_or(Duration::MAX))
    }
}

impl TokenBucket {
    /// A bucket that starts full, so the first `burst` sends go out
    /// immediately.
    pub fn new(rate_per_sec: f64, burst: usize) -> Self {
        let burst = (burst.max(1)) as f64;
        Self {
            state: Mutex::new(BucketState {
                rate: rate_per_sec.max(f64::MIN_POSITIVE),
                burst,
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    /// Consume a token now if one is available.
    pub fn allow(&self) -> bool {
        self.state.lock().acquire(Instant::now()).is_ok()
    }

    /// Block until a token is available. Cancel-safe: no token is
    /// consumed unless the future resolves.
    pub async fn wait(&self) {
        loop {
            let delay = match self.state.lock().acquire(Instant::now()) {
                Ok(()) => return,
                Err(delay) => delay,
            };
            tokio::time::sleep(delay).await;
        }
    }

    /// Adjust the refill rate. The burst cap and any accumulated
    /// tokens are unchanged.
    pub fn set_rate(&self, rate_per_sec: f64) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.refill(now);
        state.rate = rate_per_sec.max(f64::MIN_POSITIVE);
    }
}
