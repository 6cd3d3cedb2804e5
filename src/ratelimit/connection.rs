//! Per-instance concurrent connection gate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::metrics::{MetricsRecorder, NoopMetrics, CONNECTION_DURATION, CONNECTION_PASS, CONNECTION_REJECT};
use crate::error::AdmissionError;

/// Caps the number of requests in flight on this instance.
pub struct ConnectionLimiter {
    /// Maximum concurrent connections (0 = unlimited)
    max: u64,
    active: AtomicU64,
    metrics: Arc<dyn MetricsRecorder>,
}

impl ConnectionLimiter {
    pub fn new(max: u64, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            max,
            active: AtomicU64::new(0),
            metrics,
        }
    }

    /// A gate that admits everything.
    pub fn unlimited() -> Self {
        Self::new(0, Arc::new(NoopMetrics))
    }

    /// Take a connection slot.
    ///
    /// The slot is held by the returned permit and given back exactly once,
    /// when the permit is released or dropped.
    pub fn try_acquire(self: &Arc<Self>) -> Result<ConnectionPermit, AdmissionError> {
        let admitted = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (self.max == 0 || active < self.max).then_some(active + 1)
            });

        match admitted {
            Ok(_) => {
                self.metrics.increment(CONNECTION_PASS, &[]);
                Ok(ConnectionPermit {
                    limiter: Some(self.clone()),
                    started: Instant::now(),
                })
            }
            Err(active) => {
                debug!(active = active, max = self.max, "Connection limit reached");
                self.metrics.increment(CONNECTION_REJECT, &[]);
                Err(AdmissionError::ConnectionOverload { max: self.max })
            }
        }
    }

    /// Connections currently holding a slot.
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    fn release(&self, held: Duration) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.metrics.record_duration(CONNECTION_DURATION, &[], held);
    }
}

/// A held connection slot.
pub struct ConnectionPermit {
    limiter: Option<Arc<ConnectionLimiter>>,
    started: Instant,
}

impl ConnectionPermit {
    /// Give the slot back now. Returns how long it was held.
    pub fn release(mut self) -> Duration {
        self.release_once()
    }

    fn release_once(&mut self) -> Duration {
        let held = self.started.elapsed();
        if let Some(limiter) = self.limiter.take() {
            limiter.release(held);
        }
        held
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for ConnectionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPermit")
            .field("held", &self.limiter.is_some())
            .field("started", &self.started)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::metrics::InMemoryMetrics;

    fn create_limiter(max: u64) -> (Arc<ConnectionLimiter>, Arc<InMemoryMetrics>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        (Arc::new(ConnectionLimiter::new(max, metrics.clone())), metrics)
    }

    #[test]
    fn test_limit_and_release() {
        let (limiter, metrics) = create_limiter(2);

        let first = limiter.try_acquire().unwrap();
        let _second = limiter.try_acquire().unwrap();
        assert!(matches!(
            limiter.try_acquire(),
            Err(AdmissionError::ConnectionOverload { max: 2 })
        ));
        assert_eq!(limiter.active(), 2);

        first.release();
        assert_eq!(limiter.active(), 1);
        assert!(limiter.try_acquire().is_ok());

        assert_eq!(metrics.total(CONNECTION_PASS), 3);
        assert_eq!(metrics.total(CONNECTION_REJECT), 1);
    }

    #[test]
    fn test_drop_releases_once() {
        let (limiter, metrics) = create_limiter(1);
        {
            let _permit = limiter.try_acquire().unwrap();
            assert_eq!(limiter.active(), 1);
        }
        assert_eq!(limiter.active(), 0);

        // Explicit release followed by drop must not release twice
        let permit = limiter.try_acquire().unwrap();
        permit.release();
        assert_eq!(limiter.active(), 0);
        assert_eq!(metrics.samples(CONNECTION_DURATION), 2);
    }

    #[test]
    fn test_zero_means_unlimited() {
        let limiter = Arc::new(ConnectionLimiter::unlimited());
        let permits: Vec<_> = (0..100).map(|_| limiter.try_acquire().unwrap()).collect();
        assert_eq!(limiter.active(), 100);
        drop(permits);
        assert_eq!(limiter.active(), 0);
    }

    #[tokio::test]
    async fn test_release_on_panicking_handler() {
        let (limiter, _) = create_limiter(1);
        let permit = limiter.try_acquire().unwrap();

        let handle = tokio::spawn(async move {
            let _permit = permit;
            panic!("handler failed");
        });
        assert!(handle.await.is_err());
        assert_eq!(limiter.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_acquire_respects_max() {
        let (limiter, _) = create_limiter(10);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.try_acquire().ok() })
            })
            .collect();

        let mut held = Vec::new();
        for handle in handles {
            if let Some(permit) = handle.await.unwrap() {
                held.push(permit);
            }
        }
        assert_eq!(held.len(), 10);
        assert_eq!(limiter.active(), 10);
    }
}
