//! Fixed Window Algorithm
//!
//! Counts permits in a window that opens with the first acquisition and
//! lasts a fixed duration. When the window lapses the count starts over.
//!
//! A request is admitted only if it fits in what is left of the window, and
//! a refused request never touches the count.
//!
//! Up to twice the capacity can be admitted across a window boundary: a full
//! window followed immediately by a fresh one. That is the expected behavior
//! of this algorithm.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

use super::{Algorithm, RateLimitAlgorithm, PERMIT_TOLERANCE};
use crate::ratelimit::counter::{CounterResult, DistributedCount};

/// Fixed window rate limiter.
///
/// The counter must lapse one window after it is created
/// ([`CountExpiry::AfterCreate`](crate::ratelimit::counter::CountExpiry::AfterCreate)).
pub struct FixedWindowRateLimiter {
    /// Permits per window
    capacity: f64,
    /// Permits taken in the current window
    count: Arc<dyn DistributedCount>,
}

impl FixedWindowRateLimiter {
    pub fn new(capacity: f64, count: Arc<dyn DistributedCount>) -> Self {
        Self { capacity, count }
    }
}

#[async_trait]
impl RateLimitAlgorithm for FixedWindowRateLimiter {
    async fn try_acquire(&self, permits: u64) -> CounterResult<bool> {
        let permits = permits as f64;
        loop {
            let taken = self.count.get().await?;
            if taken + permits > self.capacity + PERMIT_TOLERANCE {
                trace!(key = %self.count.key(), taken = taken, capacity = self.capacity, "Fixed window full");
                return Ok(false);
            }

            // A lapsed window reads as zero, so this write also opens the next one
            if self.count.compare_and_set(taken, taken + permits).await? {
                return Ok(true);
            }
        }
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }
}
