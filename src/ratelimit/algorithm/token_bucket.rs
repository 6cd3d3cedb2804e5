//! Token Bucket Algorithm
//!
//! Tokens refill at a constant rate up to the bucket capacity; an admission
//! spends one token per permit. A full bucket allows a burst of `capacity`
//! permits at once.
//!
//! The bucket stores the instant at which it will be full again. Tokens
//! available at `now` are `capacity - max(0, full_at - now) * rate`, and
//! spending `n` tokens moves `full_at` to `max(full_at, now) + n / rate`.
//! A counter that has never been written, or has lapsed, reads as a full bucket.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

use super::{backlog, extend, now_secs, Algorithm, RateLimitAlgorithm, PERMIT_TOLERANCE};
use crate::ratelimit::counter::{CounterResult, DistributedCount};

/// Token bucket rate limiter.
pub struct TokenBucketRateLimiter {
    /// Most tokens the bucket can hold
    capacity: f64,
    /// Tokens added per second
    rate: f64,
    /// Instant (clock seconds) at which the bucket is full
    full_at: Arc<dyn DistributedCount>,
}

impl TokenBucketRateLimiter {
    pub fn new(capacity: f64, rate: f64, full_at: Arc<dyn DistributedCount>) -> Self {
        Self {
            capacity,
            rate,
            full_at,
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucketRateLimiter {
    async fn try_acquire(&self, permits: u64) -> CounterResult<bool> {
        let permits = permits as f64;
        loop {
            let full_at = self.full_at.get().await?;
            let now = now_secs();

            let tokens = self.capacity - backlog(full_at, now, self.rate);
            if tokens + PERMIT_TOLERANCE < permits {
                trace!(key = %self.full_at.key(), tokens = tokens, permits = permits, "Token bucket exhausted");
                return Ok(false);
            }

            let next = extend(full_at, now, permits, self.rate);
            if self.full_at.compare_and_set(full_at, next).await? {
                return Ok(true);
            }
        }
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }
}
