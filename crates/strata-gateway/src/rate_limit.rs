use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

use strata_core::error::{Result, StrataError};
use strata_core::types::SessionId;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Take one token, or report how long until one is available.
    fn take(&mut self, per_second: f64, capacity: f64) -> std::result::Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * per_second).min(capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / per_second))
        }
    }

    /// Untouched for `ttl` and refilled to capacity by now.
    fn is_idle(&self, now: Instant, ttl: Duration, per_second: f64, capacity: f64) -> bool {
        let elapsed = now.duration_since(self.last_refill);
        elapsed >= ttl && self.tokens + elapsed.as_secs_f64() * per_second >= capacity
    }
}

/// Per-session token bucket over inbound client messages.
///
/// A session may burst up to the per-minute cap, then refills at
/// `cap / 60` messages per second. Buckets that have sat idle until full
/// carry no state and are dropped by [`purge_idle`](Self::purge_idle).
pub struct InboundRateLimiter {
    per_second: f64,
    capacity: f64,
    buckets: DashMap<SessionId, Bucket>,
}

impl InboundRateLimiter {
    pub fn per_minute(count: u32) -> Self {
        let capacity = f64::from(count.max(1));
        Self {
            per_second: capacity / 60.0,
            capacity,
            buckets: DashMap::new(),
        }
    }

    pub fn check(&self, session: &SessionId) -> Result<()> {
        let mut bucket = self
            .buckets
            .entry(session.clone())
            .or_insert_with(|| Bucket::full(self.capacity));

        bucket.take(self.per_second, self.capacity).map_err(|retry_after| {
            warn!(session_id = %session, retry_after_ms = retry_after.as_millis() as u64, "Inbound rate limit exceeded");
            StrataError::RateLimited {
                session: session.to_string(),
                retry_after_ms: retry_after.as_millis() as u64,
            }
        })
    }

    /// Drop buckets idle for `ttl` that have refilled completely. Returns
    /// the number dropped.
    pub fn purge_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, b| !b.is_idle(now, ttl, self.per_second, self.capacity));
        before.saturating_sub(self.buckets.len())
    }

    pub fn tracked_sessions(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_burst_up_to_cap() {
        let limiter = InboundRateLimiter::per_minute(5);
        let session = SessionId::from_string("s1");
        for _ in 0..5 {
            limiter.check(&session).unwrap();
        }
        let err = limiter.check(&session).unwrap_err();
        match err {
            StrataError::RateLimited { retry_after_ms, .. } => {
                // One token every 12s at 5/min
                assert!(retry_after_ms > 11_000 && retry_after_ms <= 12_000);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_sessions_are_isolated() {
        let limiter = InboundRateLimiter::per_minute(1);
        limiter.check(&SessionId::from_string("a")).unwrap();
        assert!(limiter.check(&SessionId::from_string("a")).is_err());
        limiter.check(&SessionId::from_string("b")).unwrap();
    }

    #[test]
    fn test_purge_keeps_buckets_still_refilling() {
        // 600/min refills one token every 100ms
        let limiter = InboundRateLimiter::per_minute(600);
        let rested = SessionId::from_string("rested");
        let drained = SessionId::from_string("drained");
        limiter.check(&rested).unwrap();
        for _ in 0..600 {
            limiter.check(&drained).unwrap();
        }
        std::thread::sleep(Duration::from_millis(150));

        assert_eq!(limiter.purge_idle(Duration::from_millis(100)), 1);
        assert_eq!(limiter.tracked_sessions(), 1);
        // Idle time alone is not enough while tokens are still owed
        assert_eq!(limiter.purge_idle(Duration::ZERO), 0);
        assert_eq!(limiter.tracked_sessions(), 1);
    }

    #[test]
    fn test_refills_over_time() {
        // 600/min refills one token every 100ms
        let limiter = InboundRateLimiter::per_minute(600);
        let session = SessionId::from_string("s1");
        for _ in 0..600 {
            limiter.check(&session).unwrap();
        }
        assert!(limiter.check(&session).is_err());
        std::thread::sleep(Duration::from_millis(120));
        limiter.check(&session).unwrap();
    }
}
