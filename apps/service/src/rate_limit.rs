//! Per-identity token-bucket rate limiting. Identity is the hashed API key
//! when one is presented, the client IP otherwise; the two never stack.
//!
//! Each identity gets a bucket with capacity `max_requests`, refilled
//! continuously across the configured window, so sustained throughput is
//! bounded without the boundary bursts a fixed-window counter allows.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    refilled_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_second: f64,
    idle_horizon: Duration,
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Limited; retry after this many seconds.
    Limited { retry_after_seconds: i64 },
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_seconds: u64) -> Self {
        let capacity = f64::from(max_requests.max(1));
        let window_seconds = window_seconds.max(1);
        Self {
            capacity,
            refill_per_second: capacity / window_seconds as f64,
            idle_horizon: Duration::seconds((window_seconds * 2) as i64),
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn check(&self, identity: &str, now: DateTime<Utc>) -> RateDecision {
        let mut buckets = self.buckets.lock().await;
        // Lazy purge: a bucket idle past the horizon is full again anyway.
        if buckets.len() > 10_000 {
            let horizon = now - self.idle_horizon;
            buckets.retain(|_, bucket| bucket.refilled_at > horizon);
        }

        let bucket = buckets.entry(identity.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            refilled_at: now,
        });
        let elapsed_seconds =
            (now - bucket.refilled_at).num_milliseconds().max(0) as f64 / 1_000.0;
        bucket.tokens =
            (bucket.tokens + elapsed_seconds * self.refill_per_second).min(self.capacity);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return RateDecision::Allowed;
        }
        let deficit = 1.0 - bucket.tokens;
        let retry_after_seconds = (deficit / self.refill_per_second).ceil().max(1.0) as i64;
        RateDecision::Limited {
            retry_after_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_a_burst_up_to_capacity_then_rejects() {
        let limiter = RateLimiter::new(3, 60);
        let now = Utc::now();
        for _ in 0..3 {
            assert_eq!(limiter.check("a", now).await, RateDecision::Allowed);
        }
        assert!(matches!(
            limiter.check("a", now).await,
            RateDecision::Limited { .. }
        ));
    }

    #[tokio::test]
    async fn identities_do_not_share_buckets() {
        let limiter = RateLimiter::new(1, 60);
        let now = Utc::now();
        assert_eq!(limiter.check("a", now).await, RateDecision::Allowed);
        assert_eq!(limiter.check("b", now).await, RateDecision::Allowed);
        assert!(matches!(
            limiter.check("a", now).await,
            RateDecision::Limited { .. }
        ));
    }

    #[tokio::test]
    async fn tokens_refill_continuously_not_per_window() {
        let limiter = RateLimiter::new(1, 60);
        let now = Utc::now();
        assert_eq!(limiter.check("a", now).await, RateDecision::Allowed);

        // Half a window in: half a token back, and the retry hint covers
        // the remaining deficit.
        let halfway = limiter.check("a", now + Duration::seconds(30)).await;
        assert_eq!(
            halfway,
            RateDecision::Limited {
                retry_after_seconds: 30
            }
        );

        let refilled = limiter.check("a", now + Duration::seconds(61)).await;
        assert_eq!(refilled, RateDecision::Allowed);
    }

    #[tokio::test]
    async fn sustained_rate_is_bounded_across_window_boundaries() {
        let limiter = RateLimiter::new(2, 60);
        let now = Utc::now();
        assert_eq!(limiter.check("a", now).await, RateDecision::Allowed);
        assert_eq!(limiter.check("a", now).await, RateDecision::Allowed);

        // Past the window the bucket holds only what refilled, capped at
        // capacity; draining it leaves nothing extra at the boundary.
        let later = now + Duration::seconds(61);
        assert_eq!(limiter.check("a", later).await, RateDecision::Allowed);
        assert_eq!(limiter.check("a", later).await, RateDecision::Allowed);
        assert!(matches!(
            limiter.check("a", later).await,
            RateDecision::Limited { .. }
        ));
        // And shortly after, the trickle is still well under a token.
        assert!(matches!(
            limiter.check("a", later + Duration::seconds(2)).await,
            RateDecision::Limited { .. }
        ));
    }
}
