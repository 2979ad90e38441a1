//! Token-bucket rate limiting for handler invocations.
//!
//! When a limiter is configured, the scheduler acquires one token before
//! every read, bulk read, or write handler invocation. Tokens refill at the
//! configured rate up to the burst size, so short bursts are allowed while
//! the sustained invocation rate stays bounded.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::LimiterSettings;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket with a sustained rate and a burst capacity.
pub struct RateLimiter {
    /// Tokens added per second.
    rate: f64,
    /// Maximum tokens the bucket holds.
    burst: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(settings: &LimiterSettings) -> Self {
        let rate = settings.rate;
        // A zero burst means "same as rate".
        let burst = if settings.burst > 0.0 {
            settings.burst
        } else {
            rate
        };
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting for a refill if the bucket is empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - state.tokens) / self.rate))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    /// Take one token without waiting. Returns false if none is available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: f64, burst: f64) -> RateLimiter {
        RateLimiter::new(&LimiterSettings { rate, burst })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_block() {
        let l = limiter(10.0, 2.0);

        // The burst is immediately available.
        assert!(l.try_acquire());
        assert!(l.try_acquire());
        // The bucket is now empty.
        assert!(!l.try_acquire());

        // One token refills after 1/rate seconds.
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(l.try_acquire());
        assert!(!l.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let l = limiter(10.0, 1.0);
        l.acquire().await;

        let start = Instant::now();
        l.acquire().await;
        // Auto-advanced paused time: the second acquire had to wait ~100ms.
        assert!(start.elapsed() >= Duration::from_millis(95));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_capped_at_burst() {
        let l = limiter(100.0, 3.0);
        tokio::time::advance(Duration::from_secs(60)).await;

        // A long idle period still only buys `burst` tokens.
        assert!(l.try_acquire());
        assert!(l.try_acquire());
        assert!(l.try_acquire());
        assert!(!l.try_acquire());
    }

    #[test]
    fn test_zero_burst_defaults_to_rate() {
        let l = limiter(5.0, 0.0);
        assert_eq!(l.burst, 5.0);
        assert_eq!(l.rate, 5.0);
    }
}
