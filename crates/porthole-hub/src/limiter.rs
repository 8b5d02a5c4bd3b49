//! Per-tunnel token-bucket rate limiting.
//!
//! The bucket capacity equals the steady-state per-minute rate, so a tunnel
//! may burst one minute's worth of requests before the refill rate governs.

use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    /// A limiter allowing `rate` requests per minute.
    pub fn per_minute(rate: u32) -> Self {
        let capacity = f64::from(rate.max(1));
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            state: Mutex::new(Bucket {
                tokens: capacity,
                last: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        let mut bucket = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn allows_a_full_burst_then_denies() {
        let limiter = RateLimiter::per_minute(60);
        for i in 0..60 {
            assert!(limiter.allow(), "request {i} should pass");
        }
        assert!(!limiter.allow(), "61st request should be denied");
    }

    #[test]
    fn refills_over_time() {
        let limiter = RateLimiter::per_minute(60);
        for _ in 0..60 {
            limiter.allow();
        }
        assert!(!limiter.allow());

        // 60/min refills one token per second.
        std::thread::sleep(Duration::from_millis(1100));
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn low_rates_still_admit_one() {
        let limiter = RateLimiter::per_minute(1);
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }
}
