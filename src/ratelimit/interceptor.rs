//! Hooks around each admission check.
//!
//! Interceptors run in registration order. Before the algorithm runs, the
//! first interceptor that does not answer [`PreCheck::Allow`] decides for the
//! whole chain. After the check, every interceptor sees the outcome, whether
//! it passed, was rejected, was skipped or failed.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::dimension::LimitDimension;
use super::metrics::{
    MetricsRecorder, RATE_LIMITER_CHECK_LATENCY, RATE_LIMITER_EXCEPTION, RATE_LIMITER_PASS,
    RATE_LIMITER_REJECT,
};
use super::resource::{split_user_resource, ResourceLimit, USER_SEPARATOR};
use crate::error::{AdmissionError, CounterError};

/// Decision of a pre-check hook.
#[derive(Debug, Clone, PartialEq)]
pub enum PreCheck {
    /// Continue to the algorithm
    Allow,
    /// Exempt the resource from this dimension; neither a pass nor a reject
    Skip,
    /// Reject the request without consulting the algorithm
    Reject(AdmissionError),
}

/// How an admission check ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Passed,
    Rejected,
    Skipped,
    /// The counter store failed
    Failed,
}

/// Everything an after-check hook gets to see.
#[derive(Debug, Clone, Copy)]
pub struct LimitCheck<'a> {
    pub resource: &'a str,
    pub limit: &'a ResourceLimit,
    pub permits: u64,
    pub outcome: CheckOutcome,
    /// Time spent in the algorithm call; zero if it never ran
    pub elapsed: Duration,
    pub error: Option<&'a CounterError>,
}

/// A hook pair around admission checks.
pub trait RateLimiterInterceptor: Send + Sync {
    fn before_limit_check(&self, _resource: &str, _limit: &ResourceLimit) -> PreCheck {
        PreCheck::Allow
    }

    fn after_limit_check(&self, _check: &LimitCheck<'_>) {}
}

/// An ordered list of interceptors.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn RateLimiterInterceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor; it runs after those already registered.
    pub fn push(&mut self, interceptor: Arc<dyn RateLimiterInterceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn with(mut self, interceptor: Arc<dyn RateLimiterInterceptor>) -> Self {
        self.push(interceptor);
        self
    }

    pub fn before(&self, resource: &str, limit: &ResourceLimit) -> PreCheck {
        self.interceptors
            .iter()
            .map(|interceptor| interceptor.before_limit_check(resource, limit))
            .find(|decision| *decision != PreCheck::Allow)
            .unwrap_or(PreCheck::Allow)
    }

    pub fn after(&self, check: &LimitCheck<'_>) {
        for interceptor in &self.interceptors {
            interceptor.after_limit_check(check);
        }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

/// A deny-by-default gate for selected dimensions.
///
/// For the dimensions it guards, whitelisted resources skip the limit
/// entirely and every other resource is rejected. Resources of other
/// dimensions are left alone.
#[derive(Debug, Clone)]
pub struct WhitelistInterceptor {
    dimensions: Vec<LimitDimension>,
    entries: Vec<String>,
}

impl WhitelistInterceptor {
    pub fn new(dimensions: Vec<LimitDimension>, entries: Vec<String>) -> Self {
        Self { dimensions, entries }
    }

    /// Whether `resource` is covered by an entry.
    ///
    /// An entry covers the identical resource and everything below it, where
    /// "below" starts at a `/` or `:` boundary. For user-scoped resources the
    /// path part alone is checked too.
    pub fn is_whitelisted(&self, resource: &str) -> bool {
        let covered = |candidate: &str| self.entries.iter().any(|entry| covers(entry, candidate));
        covered(resource) || split_user_resource(resource).map_or(false, |(_, path)| covered(path))
    }
}

fn covers(entry: &str, resource: &str) -> bool {
    match resource.strip_prefix(entry) {
        Some("") => true,
        Some(rest) => {
            entry.ends_with(['/', USER_SEPARATOR]) || rest.starts_with(['/', USER_SEPARATOR])
        }
        None => false,
    }
}

impl RateLimiterInterceptor for WhitelistInterceptor {
    fn before_limit_check(&self, resource: &str, limit: &ResourceLimit) -> PreCheck {
        if !self.dimensions.contains(&limit.limit_dimension) {
            return PreCheck::Allow;
        }
        if self.is_whitelisted(resource) {
            debug!(resource = %resource, dimension = %limit.limit_dimension, "Whitelisted, skipping limit");
            return PreCheck::Skip;
        }
        PreCheck::Reject(AdmissionError::NotWhitelisted {
            dimension: limit.limit_dimension,
            resource: resource.to_string(),
        })
    }
}

/// Reports pass/reject/exception counts and check latency.
pub struct MetricsInterceptor {
    recorder: Arc<dyn MetricsRecorder>,
}

impl MetricsInterceptor {
    pub fn new(recorder: Arc<dyn MetricsRecorder>) -> Self {
        Self { recorder }
    }
}

impl RateLimiterInterceptor for MetricsInterceptor {
    fn after_limit_check(&self, check: &LimitCheck<'_>) {
        let name = match check.outcome {
            CheckOutcome::Passed => RATE_LIMITER_PASS,
            CheckOutcome::Rejected => RATE_LIMITER_REJECT,
            CheckOutcome::Failed => RATE_LIMITER_EXCEPTION,
            CheckOutcome::Skipped => return,
        };
        let labels = [
            ("dimension", check.limit.limit_dimension.as_str()),
            ("resource", check.resource),
            ("error", check.error.map_or("unknown", CounterError::kind)),
        ];
        // Only store failures carry an error class
        let counted = if check.outcome == CheckOutcome::Failed {
            &labels[..]
        } else {
            &labels[..2]
        };
        self.recorder.increment(name, counted);
        self.recorder
            .record_duration(RATE_LIMITER_CHECK_LATENCY, &labels[..2], check.elapsed);
    }
}
