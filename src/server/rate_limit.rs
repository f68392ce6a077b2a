use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::json;
use tabrelay_core_types::{RelayError, RelayErrorKind};

/// Per-caller token bucket. Tokens refill continuously at `max_per_minute /
/// 60` per second and are clamped to the bucket capacity.
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    max_per_minute: u32,
}

impl RateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            max_per_minute,
        }
    }

    pub fn max_per_minute(&self) -> u32 {
        self.max_per_minute
    }

    pub fn active_callers(&self) -> usize {
        self.buckets.len()
    }

    /// Admit or reject one call. Rejections carry the seconds until a token
    /// accrues so callers can back off instead of hammering.
    pub fn check(&self, caller: &str) -> Result<(), RelayError> {
        if self.max_per_minute == 0 {
            return Ok(());
        }
        let refill_per_sec = f64::from(self.max_per_minute) / 60.0;
        let mut entry = self
            .buckets
            .entry(caller.to_string())
            .or_insert_with(|| TokenBucket::new(self.max_per_minute));
        match entry.allow(self.max_per_minute, refill_per_sec) {
            Ok(()) => Ok(()),
            Err(retry_after_secs) => Err(RelayError::new(RelayErrorKind::RateLimited)
                .with_hint(format!("rate limit exceeded for caller {caller}"))
                .retriable(true)
                .with_data(json!({ "retryAfterSeconds": retry_after_secs }))),
        }
    }

    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        if max_idle.is_zero() {
            return 0;
        }
        let now = Instant::now();
        let stale: Vec<String> = self
            .buckets
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .is_idle(now, max_idle)
                    .then(|| entry.key().clone())
            })
            .collect();
        let mut removed = 0;
        for key in stale {
            if self.buckets.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }
}

struct TokenBucket {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(capacity: u32) -> Self {
        Self {
            tokens: f64::from(capacity),
            last: Instant::now(),
        }
    }

    fn allow(&mut self, capacity: u32, refill_per_sec: f64) -> Result<(), f64> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(f64::from(capacity));
        self.last = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err((1.0 - self.tokens) / refill_per_sec)
        }
    }

    fn is_idle(&self, now: Instant, max_idle: Duration) -> bool {
        now.duration_since(self.last) >= max_idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_spends_the_bucket_then_rejects() {
        let limiter = RateLimiter::new(60);
        for call in 0..60 {
            assert!(limiter.check("ctrl-a").is_ok(), "call {call} rejected");
        }
        let err = limiter.check("ctrl-a").unwrap_err();
        assert_eq!(err.kind, RelayErrorKind::RateLimited);
        let retry = err.data.unwrap()["retryAfterSeconds"].as_f64().unwrap();
        assert!(retry > 0.0 && retry <= 1.0, "retry hint {retry}");
    }

    #[test]
    fn refill_admits_again_after_a_second() {
        let limiter = RateLimiter::new(60);
        for _ in 0..60 {
            limiter.check("ctrl-a").unwrap();
        }
        assert!(limiter.check("ctrl-a").is_err());

        // backdate the bucket one second instead of sleeping
        limiter.buckets.get_mut("ctrl-a").unwrap().last -= Duration::from_secs(1);
        assert!(limiter.check("ctrl-a").is_ok());
        assert!(limiter.check("ctrl-a").is_err());
    }

    #[test]
    fn tokens_never_exceed_capacity() {
        let limiter = RateLimiter::new(5);
        limiter.check("ctrl-a").unwrap();
        // a long idle stretch must not bank more than the capacity
        limiter.buckets.get_mut("ctrl-a").unwrap().last -= Duration::from_secs(3_600);
        for _ in 0..5 {
            limiter.check("ctrl-a").unwrap();
        }
        assert!(limiter.check("ctrl-a").is_err());
    }

    #[test]
    fn callers_do_not_share_buckets() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check("ctrl-a").is_ok());
        assert!(limiter.check("ctrl-a").is_err());
        assert!(limiter.check("ctrl-b").is_ok());
    }

    #[test]
    fn prune_idle_removes_stale_buckets() {
        let limiter = RateLimiter::new(10);
        limiter.check("fresh").unwrap();
        limiter.check("stale").unwrap();
        limiter.buckets.get_mut("stale").unwrap().last -= Duration::from_secs(600);

        let removed = limiter.prune_idle(Duration::from_secs(300));
        assert_eq!(removed, 1);
        assert!(limiter.buckets.contains_key("fresh"));
        assert!(!limiter.buckets.contains_key("stale"));
    }
}
