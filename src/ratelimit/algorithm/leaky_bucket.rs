//! Leaky Bucket Algorithm
//!
//! The bucket holds a level that drains at a constant rate. Each admission
//! adds its permits to the level, and is refused if that would overflow the
//! capacity.
//!
//! Rather than storing the level and a timestamp, the bucket stores the single
//! instant at which it will be empty. The level at `now` is
//! `max(0, empty_at - now) * rate`, and admitting `n` permits moves `empty_at`
//! to `max(empty_at, now) + n / rate`. One number means one compare-and-set.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

use super::{backlog, extend, now_secs, Algorithm, RateLimitAlgorithm, PERMIT_TOLERANCE};
use crate::ratelimit::counter::{CounterResult, DistributedCount};

/// Leaky bucket rate limiter.
pub struct LeakyBucketRateLimiter {
    /// Largest level the bucket can hold
    capacity: f64,
    /// Permits drained per second
    rate: f64,
    /// Instant (clock seconds) at which the bucket is empty
    empty_at: Arc<dyn DistributedCount>,
}

impl LeakyBucketRateLimiter {
    pub fn new(capacity: f64, rate: f64, empty_at: Arc<dyn DistributedCount>) -> Self {
        Self {
            capacity,
            rate,
            empty_at,
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for LeakyBucketRateLimiter {
    async fn try_acquire(&self, permits: u64) -> CounterResult<bool> {
        let permits = permits as f64;
        loop {
            let empty_at = self.empty_at.get().await?;
            let now = now_secs();

            let level = backlog(empty_at, now, self.rate);
            if level + permits > self.capacity + PERMIT_TOLERANCE {
                trace!(key = %self.empty_at.key(), level = level, capacity = self.capacity, "Leaky bucket full");
                return Ok(false);
            }

            let next = extend(empty_at, now, permits, self.rate);
            if self.empty_at.compare_and_set(empty_at, next).await? {
                return Ok(true);
            }
        }
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::LeakyBucket
    }
}
