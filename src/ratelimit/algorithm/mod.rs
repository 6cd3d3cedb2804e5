//! Rate limiting algorithms
//!
//! This module provides three interchangeable admission algorithms:
//!
//! - **Fixed Window**: counts permits per window, resets when the window lapses
//! - **Leaky Bucket**: a level that drains continuously, bounded by a capacity
//! - **Token Bucket**: tokens refill continuously up to a capacity, bursts allowed
//!
//! Algorithms keep their whole state in a single [`DistributedCount`], and
//! update it with compare-and-set retry loops or atomic increments. The same
//! code therefore runs against an in-process counter or a shared store, and
//! contention never spans more than one limiter.

mod fixed_window;
mod leaky_bucket;
mod token_bucket;

pub use fixed_window::FixedWindowRateLimiter;
pub use leaky_bucket::LeakyBucketRateLimiter;
pub use token_bucket::TokenBucketRateLimiter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::backend::CounterBackend;
use super::counter::{CountExpiry, CounterResult};
use super::resource::ResourceLimit;

/// Start of the clock bucket schedules are measured on (2024-01-01T00:00:00Z).
///
/// Keeps timestamps small so `f64` seconds stay precise to well under a microsecond.
const CLOCK_EPOCH_SECS: u64 = 1_704_067_200;

/// Slack granted when comparing fractional permit amounts.
const PERMIT_TOLERANCE: f64 = 1e-6;

/// Admission algorithm of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Algorithm {
    FixedWindow,
    LeakyBucket,
    TokenBucket,
}

impl Algorithm {
    /// Whether this algorithm is rate based rather than window based.
    pub fn is_bucket(&self) -> bool {
        matches!(self, Algorithm::LeakyBucket | Algorithm::TokenBucket)
    }
}

/// A limiter instance guarding one resource.
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync {
    /// Try to take `permits` permits.
    ///
    /// Returns `Ok(false)` when the limit denies them, and an error only when
    /// the backing counter could not be reached.
    async fn try_acquire(&self, permits: u64) -> CounterResult<bool>;

    /// Which algorithm this instance runs.
    fn algorithm(&self) -> Algorithm;
}

/// Build the limiter instance for `limit`, keeping its state under `key`.
pub fn build_algorithm(
    limit: &ResourceLimit,
    key: &str,
    backend: &dyn CounterBackend,
) -> Arc<dyn RateLimitAlgorithm> {
    match limit.algorithm {
        Algorithm::FixedWindow => {
            let window = limit.window();
            Arc::new(FixedWindowRateLimiter::new(
                limit.limit,
                backend.counter(key, CountExpiry::AfterCreate(window)),
            ))
        }
        Algorithm::LeakyBucket => {
            let (capacity, rate) = (limit.bucket_capacity(), limit.rate());
            Arc::new(LeakyBucketRateLimiter::new(
                capacity,
                rate,
                backend.counter(key, CountExpiry::AfterWrite(settle_time(capacity, rate))),
            ))
        }
        Algorithm::TokenBucket => {
            let (capacity, rate) = (limit.bucket_capacity(), limit.rate());
            Arc::new(TokenBucketRateLimiter::new(
                capacity,
                rate,
                backend.counter(key, CountExpiry::AfterWrite(settle_time(capacity, rate))),
            ))
        }
    }
}

/// How long a limiter built for `limit` carries state after its last use.
///
/// Dropping an idle instance sooner would hand its resource a fresh quota.
pub fn state_lifetime(limit: &ResourceLimit) -> Duration {
    match limit.algorithm {
        Algorithm::FixedWindow => limit.window(),
        Algorithm::LeakyBucket | Algorithm::TokenBucket => settle_time(limit.bucket_capacity(), limit.rate()),
    }
}

/// Time after which an untouched bucket is back at its resting state.
fn settle_time(capacity: f64, rate: f64) -> Duration {
    Duration::try_from_secs_f64(capacity / rate + 1.0).unwrap_or(Duration::MAX)
}

/// Seconds since [`CLOCK_EPOCH_SECS`] on the wall clock shared by all instances.
pub(crate) fn now_secs() -> f64 {
    let epoch = UNIX_EPOCH + Duration::from_secs(CLOCK_EPOCH_SECS);
    SystemTime::now()
        .duration_since(epoch)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Permits still queued on a schedule that completes at `until`.
fn backlog(until: f64, now: f64, rate: f64) -> f64 {
    (until - now).max(0.0) * rate
}

/// Completion time of a schedule after queueing `permits` more.
fn extend(until: f64, now: f64, permits: f64, rate: f64) -> f64 {
    until.max(now) + permits / rate
}
