//! Named observations emitted by the admission layer.
//!
//! The core only emits; aggregation and export belong to the
//! [`MetricsRecorder`] implementation a deployment plugs in. [`FacadeMetrics`]
//! forwards to the process-wide `metrics` recorder, so any exporter installed
//! there (Prometheus, StatsD, ...) sees the `rate.limiter.*` series.

use ::metrics::{counter, histogram, Label};
use std::time::Duration;

#[cfg(test)]
pub(crate) use memory::InMemoryMetrics;

/// Admission checks the limiter allowed.
pub const RATE_LIMITER_PASS: &str = "rate.limiter.pass";
/// Admission checks the limiter or a gate rejected.
pub const RATE_LIMITER_REJECT: &str = "rate.limiter.reject";
/// Admission checks that failed on the counter store.
pub const RATE_LIMITER_EXCEPTION: &str = "rate.limiter.exception";
/// Store failures resolved by the degrade policy.
pub const RATE_LIMITER_DEGRADED: &str = "rate.limiter.degraded";
/// Time spent in the algorithm call.
pub const RATE_LIMITER_CHECK_LATENCY: &str = "rate.limiter.check.latency";
/// Connections admitted by the connection gate.
pub const CONNECTION_PASS: &str = "rate.limiter.connection.pass";
/// Connections refused by the connection gate.
pub const CONNECTION_REJECT: &str = "rate.limiter.connection.reject";
/// Lifetime of admitted connections.
pub const CONNECTION_DURATION: &str = "rate.limiter.connection.duration";

/// Label pairs attached to an observation.
pub type Labels<'a> = &'a [(&'static str, &'a str)];

/// Receiver of metric observations.
pub trait MetricsRecorder: Send + Sync {
    /// Add one to the counter `name`.
    fn increment(&self, name: &'static str, labels: Labels<'_>);

    /// Record one timing sample for `name`.
    fn record_duration(&self, name: &'static str, labels: Labels<'_>, elapsed: Duration);
}

/// A recorder that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn increment(&self, _name: &'static str, _labels: Labels<'_>) {}

    fn record_duration(&self, _name: &'static str, _labels: Labels<'_>, _elapsed: Duration) {}
}

/// A recorder emitting through the `metrics` facade.
///
/// Counters map to `counter!`, timings to `histogram!` in seconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMetrics;

fn facade_labels(labels: Labels<'_>) -> Vec<Label> {
    labels
        .iter()
        .map(|(key, value)| Label::new(*key, value.to_string()))
        .collect()
}

impl MetricsRecorder for FacadeMetrics {
    fn increment(&self, name: &'static str, labels: Labels<'_>) {
        counter!(name, facade_labels(labels)).increment(1);
    }

    fn record_duration(&self, name: &'static str, labels: Labels<'_>, elapsed: Duration) {
        histogram!(name, facade_labels(labels)).record(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod memory {
    use dashmap::DashMap;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use super::{Labels, MetricsRecorder};

    #[derive(Debug, Default)]
    struct Timer {
        count: AtomicU64,
        total_micros: AtomicU64,
        max_micros: AtomicU64,
    }

    /// Aggregated timing samples of one series.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TimerSnapshot {
        pub count: u64,
        pub total_micros: u64,
        pub max_micros: u64,
    }

    /// Point-in-time copy of every series.
    #[derive(Debug, Clone, Default)]
    pub struct MetricsSnapshot {
        pub counters: BTreeMap<String, u64>,
        pub timers: BTreeMap<String, TimerSnapshot>,
    }

    /// A recorder keeping counters and timers in memory, for assertions.
    ///
    /// Series are keyed by name plus labels, e.g. `rate.limiter.pass{dimension=URL,resource=/a/}`.
    #[derive(Debug, Default)]
    pub struct InMemoryMetrics {
        counters: DashMap<String, AtomicU64>,
        timers: DashMap<String, Timer>,
    }

    fn series(name: &str, labels: Labels<'_>) -> String {
        if labels.is_empty() {
            return name.to_string();
        }
        let labels: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        format!("{}{{{}}}", name, labels.join(","))
    }

    impl InMemoryMetrics {
        pub fn new() -> Self {
            Self::default()
        }

        /// Value of one counter series.
        pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
            self.counters
                .get(&series(name, labels))
                .map_or(0, |c| c.load(Ordering::Relaxed))
        }

        /// Sum of a counter over all label sets.
        pub fn total(&self, name: &str) -> u64 {
            let prefix = format!("{}{{", name);
            self.counters
                .iter()
                .filter(|entry| entry.key() == name || entry.key().starts_with(&prefix))
                .map(|entry| entry.value().load(Ordering::Relaxed))
                .sum()
        }

        /// Number of timing samples of a metric over all label sets.
        pub fn samples(&self, name: &str) -> u64 {
            let prefix = format!("{}{{", name);
            self.timers
                .iter()
                .filter(|entry| entry.key() == name || entry.key().starts_with(&prefix))
                .map(|entry| entry.value().count.load(Ordering::Relaxed))
                .sum()
        }

        pub fn snapshot(&self) -> MetricsSnapshot {
            MetricsSnapshot {
                counters: self
                    .counters
                    .iter()
                    .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                    .collect(),
                timers: self
                    .timers
                    .iter()
                    .map(|entry| {
                        let timer = entry.value();
                        let snapshot = TimerSnapshot {
                            count: timer.count.load(Ordering::Relaxed),
                            total_micros: timer.total_micros.load(Ordering::Relaxed),
                            max_micros: timer.max_micros.load(Ordering::Relaxed),
                        };
                        (entry.key().clone(), snapshot)
                    })
                    .collect(),
            }
        }
    }

    impl MetricsRecorder for InMemoryMetrics {
        fn increment(&self, name: &'static str, labels: Labels<'_>) {
            self.counters
                .entry(series(name, labels))
                .or_default()
                .fetch_add(1, Ordering::Relaxed);
        }

        fn record_duration(&self, name: &'static str, labels: Labels<'_>, elapsed: Duration) {
            let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
            let timer = self.timers.entry(series(name, labels)).or_default();
            timer.count.fetch_add(1, Ordering::Relaxed);
            timer.total_micros.fetch_add(micros, Ordering::Relaxed);
            timer.max_micros.fetch_max(micros, Ordering::Relaxed);
        }
    }
}
