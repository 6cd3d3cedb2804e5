//! Counters holding limiter state.
//!
//! A [`DistributedCount`] is a keyed numeric value with atomic read and
//! update operations. Limiter algorithms keep all of their state in one
//! counter, so the same algorithm code runs against an in-process counter or
//! against a shared store reachable by every instance.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::CounterError;

/// Result type for counter operations.
pub type CounterResult<T> = std::result::Result<T, CounterError>;

/// When a counter's value lapses back to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountExpiry {
    /// The value never lapses
    Never,
    /// The value lapses a fixed time after the write that created it
    AfterCreate(Duration),
    /// The value lapses once it has not been written for the given time
    AfterWrite(Duration),
}

/// A keyed numeric value with atomic operations.
///
/// An absent or lapsed counter reads as zero.
#[async_trait]
pub trait DistributedCount: Send + Sync {
    /// The key this counter is stored under.
    fn key(&self) -> &str;

    /// Read the current value.
    async fn get(&self) -> CounterResult<f64>;

    /// Overwrite the value.
    async fn set(&self, value: f64) -> CounterResult<()>;

    /// Add `delta` and return the new value.
    async fn increment(&self, delta: f64) -> CounterResult<f64>;

    /// Subtract `delta` and return the new value.
    ///
    /// Decrementing an absent or lapsed counter leaves it absent and returns zero.
    async fn decrement(&self, delta: f64) -> CounterResult<f64>;

    /// Replace the value with `value` if it currently equals `expected`.
    async fn compare_and_set(&self, expected: f64, value: f64) -> CounterResult<bool>;
}

#[derive(Debug, Clone, Copy)]
struct Cell {
    value: f64,
    exists: bool,
    expires_at: Option<Instant>,
}

impl Cell {
    const EMPTY: Cell = Cell {
        value: 0.0,
        exists: false,
        expires_at: None,
    };

    fn is_live(&self, now: Instant) -> bool {
        self.exists && self.expires_at.map_or(true, |at| now < at)
    }

    fn current(&self, now: Instant) -> f64 {
        if self.is_live(now) {
            self.value
        } else {
            0.0
        }
    }
}

/// An in-process counter.
///
/// Every update is a compare-and-swap retry loop on a single cell, so
/// contention is confined to callers of this one counter.
pub struct LocalCount {
    key: String,
    expiry: CountExpiry,
    cell: ArcSwap<Cell>,
}

impl LocalCount {
    /// Create a counter starting at zero.
    pub fn new(key: impl Into<String>, expiry: CountExpiry) -> Self {
        Self {
            key: key.into(),
            expiry,
            cell: ArcSwap::from_pointee(Cell::EMPTY),
        }
    }

    /// Compute the cell that results from writing `value` over `previous`.
    fn written(&self, previous: &Cell, value: f64, now: Instant) -> Cell {
        let expires_at = match self.expiry {
            CountExpiry::Never => None,
            CountExpiry::AfterCreate(_) if previous.is_live(now) => previous.expires_at,
            // A deadline past what Instant can represent never arrives
            CountExpiry::AfterCreate(ttl) | CountExpiry::AfterWrite(ttl) => now.checked_add(ttl),
        };
        Cell {
            value,
            exists: true,
            expires_at,
        }
    }

    /// Apply `update` atomically.
    ///
    /// `update` sees the live value and returns the value to write, or `None`
    /// to leave the cell untouched. Returns the value written, if any.
    fn update<F>(&self, mut update: F) -> Option<f64>
    where
        F: FnMut(&Cell, Instant) -> Option<f64>,
    {
        let mut current = self.cell.load_full();
        loop {
            let now = Instant::now();
            let value = update(&current, now)?;
            let next = Arc::new(self.written(&current, value, now));
            let previous = self.cell.compare_and_swap(&current, next);
            if Arc::ptr_eq(&previous, &current) {
                return Some(value);
            }
            current = arc_swap::Guard::into_inner(previous);
        }
    }
}

#[async_trait]
impl DistributedCount for LocalCount {
    fn key(&self) -> &str {
        &self.key
    }

    async fn get(&self) -> CounterResult<f64> {
        Ok(self.cell.load().current(Instant::now()))
    }

    async fn set(&self, value: f64) -> CounterResult<()> {
        let now = Instant::now();
        self.cell.store(Arc::new(self.written(&Cell::EMPTY, value, now)));
        Ok(())
    }

    async fn increment(&self, delta: f64) -> CounterResult<f64> {
        let value = self.update(|cell, now| Some(cell.current(now) + delta));
        Ok(value.unwrap_or(delta))
    }

    async fn decrement(&self, delta: f64) -> CounterResult<f64> {
        let value = self.update(|cell, now| cell.is_live(now).then(|| cell.value - delta));
        Ok(value.unwrap_or(0.0))
    }

    async fn compare_and_set(&self, expected: f64, value: f64) -> CounterResult<bool> {
        let written = self.update(|cell, now| (cell.current(now) == expected).then_some(value));
        Ok(written.is_some())
    }
}

impl std::fmt::Debug for LocalCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCount")
            .field("key", &self.key)
            .field("expiry", &self.expiry)
            .field("value", &self.cell.load().current(Instant::now()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_increment_and_decrement() {
        let count = LocalCount::new("k", CountExpiry::Never);

        assert_eq!(count.increment(3.0).await.unwrap(), 3.0);
        assert_eq!(count.increment(2.0).await.unwrap(), 5.0);
        assert_eq!(count.decrement(1.0).await.unwrap(), 4.0);
        assert_eq!(count.get().await.unwrap(), 4.0);
        assert_eq!(count.key(), "k");
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let count = LocalCount::new("k", CountExpiry::Never);
        count.set(10.0).await.unwrap();

        assert!(!count.compare_and_set(9.0, 20.0).await.unwrap());
        assert_eq!(count.get().await.unwrap(), 10.0);

        assert!(count.compare_and_set(10.0, 20.0).await.unwrap());
        assert_eq!(count.get().await.unwrap(), 20.0);
    }

    #[tokio::test]
    async fn test_expiry_after_create_keeps_deadline() {
        let count = LocalCount::new("k", CountExpiry::AfterCreate(Duration::from_millis(200)));
        count.increment(1.0).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        // A later write must not push the deadline out
        count.increment(1.0).await.unwrap();
        assert_eq!(count.get().await.unwrap(), 2.0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.get().await.unwrap(), 0.0);

        // Decrementing a lapsed counter does not resurrect it
        assert_eq!(count.decrement(1.0).await.unwrap(), 0.0);
        assert_eq!(count.get().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_expiry_after_write_extends_deadline() {
        let count = LocalCount::new("k", CountExpiry::AfterWrite(Duration::from_millis(200)));
        count.increment(1.0).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        count.increment(1.0).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(count.get().await.unwrap(), 2.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let count = Arc::new(LocalCount::new("k", CountExpiry::Never));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let count = count.clone();
                tokio::spawn(async move {
                    for _ in 0..500 {
                        count.increment(1.0).await.unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(count.get().await.unwrap(), 4000.0);
    }
}
