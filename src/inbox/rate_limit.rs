//! Per-host inbound rate limiting (§4.5 "Rate limiting"): a token bucket per sending host,
//! refilled continuously at `limit_per_min / 60` tokens/sec, capped at `limit_per_min` tokens.
//!
//! Grounded on [`crate::queue::circuit_breaker::CircuitBreakerRegistry`]'s per-host
//! `Mutex<HashMap<...>>` shape (§5: "circuit-breaker map: per-host-entry lock").

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-host token bucket rate limiter.
pub struct RateLimiter {
    limit_per_min: u32,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// Builds a limiter allowing `limit_per_min` requests/minute per host (§6: default 100).
    pub fn new(limit_per_min: u32) -> Self {
        RateLimiter {
            limit_per_min,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Attempts to consume one token for `host`. Returns `false` once exhausted (caller responds
    /// 429, §4.5).
    pub fn try_acquire(&self, host: &str) -> bool {
        let capacity = f64::from(self.limit_per_min);
        let refill_per_sec = capacity / 60.0;
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        let bucket = buckets.entry(host.to_string()).or_insert_with(|| Bucket {
            tokens: capacity,
            last_refill: now,
        });
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(capacity);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drops buckets untouched for longer than `idle_for`, run on a minute tick (§4.5
    /// "cleanup every minute").
    pub fn cleanup(&self, idle_for: Duration) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        buckets.retain(|_, bucket| now.duration_since(bucket.last_refill) < idle_for);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_configured_limit() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.try_acquire("host.example"));
        assert!(limiter.try_acquire("host.example"));
        assert!(!limiter.try_acquire("host.example"));
    }

    #[test]
    fn hosts_are_tracked_independently() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.try_acquire("a.example"));
        assert!(limiter.try_acquire("b.example"));
        assert!(!limiter.try_acquire("a.example"));
    }

    #[test]
    fn cleanup_drops_idle_buckets() {
        let limiter = RateLimiter::new(1);
        limiter.try_acquire("host.example");
        limiter.cleanup(Duration::from_secs(0));
        assert_eq!(limiter.buckets.lock().unwrap().len(), 0);
    }
}
