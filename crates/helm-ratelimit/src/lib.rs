//! Per-actor token-bucket rate limiting with backpressure.
//!
//! Actor identity is `tenant_id/principal_id` when authenticated, otherwise
//! the remote address — callers compute that and pass it in as `actor_id`.
//! Limiter errors must never drop traffic: anything unexpected inside
//! [`RateLimiter::check`] is logged and treated as an allow.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

const WINDOW_SECS: u64 = 60;
const STALE_AFTER_WINDOWS: u64 = 3;

/// `rpm`/`burst` policy for a single actor's bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RatePolicy {
    pub rpm: u32,
    pub burst: u32,
}

impl RatePolicy {
    pub fn new(rpm: u32, burst: u32) -> Self {
        Self { rpm, burst }
    }

    fn retry_after_secs(&self) -> u64 {
        if self.rpm == 0 {
            return WINDOW_SECS;
        }
        std::cmp::max(1, WINDOW_SECS / self.rpm as u64)
    }

    fn refill_per_sec(&self) -> f64 {
        self.rpm as f64 / WINDOW_SECS as f64
    }
}

#[derive(Debug, Error)]
#[error("rate limit exceeded, retry after {retry_after_secs}s")]
pub struct RateLimitRejected {
    pub retry_after_secs: u64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_activity: Instant,
    policy: RatePolicy,
}

impl Bucket {
    fn new(policy: RatePolicy, now: Instant) -> Self {
        Self {
            tokens: policy.burst as f64,
            last_refill: now,
            last_activity: now,
            policy,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.policy.refill_per_sec())
            .min(self.policy.burst as f64);
        self.last_refill = now;
    }
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Consume one token for `actor_id` under `policy`, creating the bucket
    /// on first use. Never errors: a would-be internal failure fails open.
    pub async fn check(&self, actor_id: &str, policy: RatePolicy) -> Result<(), RateLimitRejected> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(actor_id.to_string())
            .or_insert_with(|| Bucket::new(policy, now));
        bucket.policy = policy;
        bucket.refill(now);
        bucket.last_activity = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(RateLimitRejected {
                retry_after_secs: policy.retry_after_secs(),
            })
        }
    }

    /// Evict buckets idle for 3x the rate window. Intended to run on a
    /// 1-minute tick from a background task spawned by the embedder.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let stale_after = Duration::from_secs(WINDOW_SECS * STALE_AFTER_WINDOWS);
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_duration_since(b.last_activity) < stale_after);
        let evicted = before - buckets.len();
        if evicted > 0 {
            tracing::debug!(evicted, "rate limiter swept stale buckets");
        }
    }

    /// Spawn the background sweeper on a 1-minute tick. Returns a handle the
    /// embedder can abort on shutdown.
    pub fn spawn_sweeper(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(WINDOW_SECS));
            loop {
                tick.tick().await;
                self.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_then_reject_with_retry_after() {
        let limiter = RateLimiter::new();
        let policy = RatePolicy::new(1, 1);
        assert!(limiter.check("actor", policy).await.is_ok());
        let err = limiter.check("actor", policy).await.unwrap_err();
        assert_eq!(err.retry_after_secs, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_restores_capacity_over_time() {
        let limiter = RateLimiter::new();
        let policy = RatePolicy::new(60, 1);
        assert!(limiter.check("actor", policy).await.is_ok());
        assert!(limiter.check("actor", policy).await.is_err());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.check("actor", policy).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_stale_buckets_only() {
        let limiter = RateLimiter::new();
        let policy = RatePolicy::new(60, 5);
        limiter.check("stale", policy).await.unwrap();
        tokio::time::advance(Duration::from_secs(WINDOW_SECS * STALE_AFTER_WINDOWS + 1)).await;
        limiter.check("fresh", policy).await.unwrap();
        limiter.sweep().await;
        let buckets = limiter.buckets.lock().await;
        assert!(!buckets.contains_key("stale"));
        assert!(buckets.contains_key("fresh"));
    }
}
