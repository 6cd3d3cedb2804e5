//! Counter backends for abstracting local and shared-store deployments.

use std::sync::Arc;

use super::counter::{CountExpiry, DistributedCount, LocalCount};

/// Factory for the counters behind limiter instances.
///
/// A deployment picks one backend for globally scoped rules; locally scoped
/// rules always use [`LocalBackend`].
pub trait CounterBackend: Send + Sync {
    /// Create the counter stored under `key`.
    fn counter(&self, key: &str, expiry: CountExpiry) -> Arc<dyn DistributedCount>;

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}

/// Backend creating in-process counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalBackend;

impl CounterBackend for LocalBackend {
    fn counter(&self, key: &str, expiry: CountExpiry) -> Arc<dyn DistributedCount> {
        Arc::new(LocalCount::new(key, expiry))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
