//! Per-dimension rate limiter service.
//!
//! A [`RateLimiterService`] checks requests against the rules of one
//! dimension: derive the resource keys, resolve the rule, fetch or create the
//! limiter instance for the resolved resource, run the interceptors around
//! the algorithm call, and apply the degrade policy when the counter store
//! fails.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::algorithm::{build_algorithm, state_lifetime, RateLimitAlgorithm};
use super::backend::{CounterBackend, LocalBackend};
use super::dimension::LimitDimension;
use super::interceptor::{CheckOutcome, InterceptorChain, LimitCheck, PreCheck};
use super::metrics::{MetricsRecorder, NoopMetrics, RATE_LIMITER_DEGRADED};
use super::request::AdmissionRequest;
use super::resource::{generate_key, ResInfo, ResLimitInfo, ResourceLimit, WorkScope};
use super::rules::RuleRegistry;
use super::strategy::{strategy_for, DimensionStrategy};
use crate::error::{AdmissionError, CounterError};

/// Default key namespace in the counter store.
pub const DEFAULT_NAMESPACE: &str = "floodgate";
/// Default bound on one counter store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(200);

/// What to do when the counter store fails or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradePolicy {
    /// Admit the request
    FailOpen,
    /// Reject the request
    FailClosed,
}

/// A limiter instance together with the rule it was built from.
struct CachedLimiter {
    limit: Arc<ResourceLimit>,
    algorithm: Arc<dyn RateLimitAlgorithm>,
    /// Milliseconds after its last use during which the instance still holds state
    lifetime: u64,
    /// Milliseconds since the service started
    last_used: AtomicU64,
}

/// Admission checks for one dimension.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiterService {
    strategy: Arc<dyn DimensionStrategy>,
    rules: Arc<RuleRegistry>,
    /// Limiter instances indexed by counter store key
    limiters: DashMap<String, Arc<CachedLimiter>>,
    interceptors: InterceptorChain,
    /// Backing for locally scoped rules
    local: Arc<dyn CounterBackend>,
    /// Backing for globally scoped rules
    global: Arc<dyn CounterBackend>,
    namespace: String,
    degrade: DegradePolicy,
    store_timeout: Duration,
    metrics: Arc<dyn MetricsRecorder>,
    started: Instant,
}

impl RateLimiterService {
    /// Create a service for `dimension` reading rules from `rules`.
    ///
    /// Until configured otherwise, every rule is backed by in-process
    /// counters and no interceptors run.
    pub fn new(dimension: LimitDimension, rules: Arc<RuleRegistry>, degrade: DegradePolicy) -> Self {
        Self::with_strategy(strategy_for(dimension), rules, degrade)
    }

    pub fn with_strategy(
        strategy: Arc<dyn DimensionStrategy>,
        rules: Arc<RuleRegistry>,
        degrade: DegradePolicy,
    ) -> Self {
        Self {
            strategy,
            rules,
            limiters: DashMap::new(),
            interceptors: InterceptorChain::new(),
            local: Arc::new(LocalBackend),
            global: Arc::new(LocalBackend),
            namespace: DEFAULT_NAMESPACE.to_string(),
            degrade,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            metrics: Arc::new(NoopMetrics),
            started: Instant::now(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the backing of globally scoped rules.
    pub fn with_global_backend(mut self, backend: Arc<dyn CounterBackend>) -> Self {
        self.global = backend;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_interceptors(mut self, interceptors: InterceptorChain) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Set the recorder for degraded decisions.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn dimension(&self) -> LimitDimension {
        self.strategy.dimension()
    }

    /// Check one request, with the permits its dimension derives from it.
    pub async fn check_limit(&self, request: &AdmissionRequest) -> Result<(), AdmissionError> {
        self.check_limit_with_permits(request, None).await
    }

    /// Check one request, consuming `permits` if given.
    ///
    /// Requests this dimension ignores, requests matching no rule and checks
    /// of zero permits are admitted without touching any limiter.
    pub async fn check_limit_with_permits(
        &self,
        request: &AdmissionRequest,
        permits: Option<u64>,
    ) -> Result<(), AdmissionError> {
        let dimension = self.dimension();
        if self.strategy.ignore_request(request) {
            trace!(dimension = %dimension, path = %request.path, "Request ignored by dimension");
            return Ok(());
        }
        let Some(resource) = self.strategy.build_resource(request) else {
            return Ok(());
        };

        let info = ResInfo::new(resource).with_extra(self.strategy.build_extra_resources(request));
        let Some(resolved) = self.rules.snapshot().get_rate_limit_rule(dimension, &info) else {
            trace!(dimension = %dimension, resource = %info.resource, "No rule matched");
            return Ok(());
        };

        let permits = self.strategy.apply_permits(request, permits);
        if permits == 0 {
            return Ok(());
        }
        self.check_resolved(&resolved, permits).await
    }

    async fn check_resolved(&self, resolved: &ResLimitInfo, permits: u64) -> Result<(), AdmissionError> {
        let ResLimitInfo { resource, limit } = resolved;
        let report = |outcome: CheckOutcome, elapsed: Duration, error: Option<&CounterError>| {
            self.interceptors.after(&LimitCheck {
                resource: resource.as_str(),
                limit: limit.as_ref(),
                permits,
                outcome,
                elapsed,
                error,
            })
        };

        match self.interceptors.before(resource, limit) {
            PreCheck::Allow => {}
            PreCheck::Skip => {
                report(CheckOutcome::Skipped, Duration::ZERO, None);
                return Ok(());
            }
            PreCheck::Reject(error) => {
                report(CheckOutcome::Rejected, Duration::ZERO, None);
                return Err(error);
            }
        }

        let algorithm = self.limiter_for(resource, limit);
        let started = Instant::now();
        let result = tokio::time::timeout(self.store_timeout, algorithm.try_acquire(permits))
            .await
            .unwrap_or(Err(CounterError::Timeout(self.store_timeout)));
        let elapsed = started.elapsed();

        match result {
            Ok(true) => {
                report(CheckOutcome::Passed, elapsed, None);
                Ok(())
            }
            Ok(false) => {
                report(CheckOutcome::Rejected, elapsed, None);
                debug!(
                    dimension = %limit.limit_dimension,
                    resource = %resource,
                    permits = permits,
                    "Rate limit exceeded"
                );
                Err(AdmissionError::Overload {
                    dimension: limit.limit_dimension,
                    resource: resource.clone(),
                })
            }
            Err(error) => {
                report(CheckOutcome::Failed, elapsed, Some(&error));
                self.apply_degrade(resource, limit, error)
            }
        }
    }

    /// Resolve a counter store failure. Both policies count as degraded.
    fn apply_degrade(&self, resource: &str, limit: &ResourceLimit, error: CounterError) -> Result<(), AdmissionError> {
        let dimension = limit.limit_dimension;
        self.metrics.increment(
            RATE_LIMITER_DEGRADED,
            &[("dimension", dimension.as_str()), ("resource", resource)],
        );

        match self.degrade {
            DegradePolicy::FailOpen => {
                warn!(dimension = %dimension, resource = %resource, error = %error, "Counter store failed, admitting request");
                Ok(())
            }
            DegradePolicy::FailClosed => {
                warn!(dimension = %dimension, resource = %resource, error = %error, "Counter store failed, rejecting request");
                Err(AdmissionError::Degraded {
                    dimension,
                    resource: resource.to_string(),
                    source: error,
                })
            }
        }
    }

    /// Get or create the limiter instance for a resolved resource.
    ///
    /// Exactly one instance exists per key; an instance built from an
    /// outdated rule is replaced.
    fn limiter_for(&self, resource: &str, limit: &Arc<ResourceLimit>) -> Arc<dyn RateLimitAlgorithm> {
        let key = generate_key(&self.namespace, resource, limit);
        let now = self.uptime_millis();

        let current = |cached: &CachedLimiter| Arc::ptr_eq(&cached.limit, limit) || cached.limit == *limit;
        if let Some(cached) = self.limiters.get(&key) {
            if current(&cached) {
                cached.last_used.store(now, Ordering::Relaxed);
                return cached.algorithm.clone();
            }
        }

        let cached = match self.limiters.entry(key) {
            Entry::Occupied(mut entry) => {
                if !current(entry.get()) {
                    debug!(key = %entry.key(), "Rule changed, replacing limiter");
                    let fresh = self.build_limiter(entry.key(), limit, now);
                    entry.insert(fresh);
                }
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let fresh = self.build_limiter(entry.key(), limit, now);
                entry.insert(fresh).value().clone()
            }
        };
        cached.last_used.store(now, Ordering::Relaxed);
        cached.algorithm.clone()
    }

    fn build_limiter(&self, key: &str, limit: &Arc<ResourceLimit>, now: u64) -> Arc<CachedLimiter> {
        let backend = match limit.scope {
            WorkScope::Local => &self.local,
            WorkScope::Global => &self.global,
        };
        debug!(
            key = %key,
            algorithm = ?limit.algorithm,
            limit = limit.limit,
            backend = backend.name(),
            "Creating new limiter"
        );
        Arc::new(CachedLimiter {
            limit: limit.clone(),
            algorithm: build_algorithm(limit, key, backend.as_ref()),
            lifetime: millis(state_lifetime(limit)),
            last_used: AtomicU64::new(now),
        })
    }

    fn uptime_millis(&self) -> u64 {
        millis(self.started.elapsed())
    }

    /// Drop limiters unused for at least `idle`. Returns how many were dropped.
    ///
    /// A limiter is kept until its window has lapsed or its bucket has
    /// settled, however small `idle` is, so eviction never resets a quota.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let now = self.uptime_millis();
        let idle = millis(idle);
        let before = self.limiters.len();
        self.limiters.retain(|_, cached| {
            now.saturating_sub(cached.last_used.load(Ordering::Relaxed)) < idle.max(cached.lifetime)
        });
        let evicted = before.saturating_sub(self.limiters.len());
        if evicted > 0 {
            debug!(dimension = %self.dimension(), evicted = evicted, "Evicted idle limiters");
        }
        evicted
    }

    /// Get the number of live limiter instances.
    pub fn limiter_count(&self) -> usize {
        self.limiters.len()
    }

    /// Drop all limiter instances.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.limiters.clear();
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::algorithm::Algorithm;
    use crate::ratelimit::counter::{CountExpiry, CounterResult, DistributedCount, LocalCount};
    use crate::ratelimit::interceptor::{MetricsInterceptor, WhitelistInterceptor};
    use crate::ratelimit::metrics::{InMemoryMetrics, RATE_LIMITER_EXCEPTION, RATE_LIMITER_PASS};
    use crate::ratelimit::resource::TimeUnit;
    use crate::ratelimit::rules::RuleSet;
    use async_trait::async_trait;
    use http::Method;

    /// Counter store that fails or hangs on every call.
    struct BrokenCount {
        hang: bool,
    }

    #[async_trait]
    impl DistributedCount for BrokenCount {
        fn key(&self) -> &str {
            "broken"
        }

        async fn get(&self) -> CounterResult<f64> {
            self.fail().await
        }

        async fn set(&self, _value: f64) -> CounterResult<()> {
            self.fail().await.map(|_| ())
        }

        async fn increment(&self, _delta: f64) -> CounterResult<f64> {
            self.fail().await
        }

        async fn decrement(&self, _delta: f64) -> CounterResult<f64> {
            self.fail().await
        }

        async fn compare_and_set(&self, _expected: f64, _value: f64) -> CounterResult<bool> {
            self.fail().await.map(|_| false)
        }
    }

    impl BrokenCount {
        async fn fail(&self) -> CounterResult<f64> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Err(CounterError::Backend("connection refused".to_string()))
        }
    }

    struct BrokenBackend {
        hang: bool,
    }

    impl CounterBackend for BrokenBackend {
        fn counter(&self, _key: &str, _expiry: CountExpiry) -> Arc<dyn DistributedCount> {
            Arc::new(BrokenCount { hang: self.hang })
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    /// In-process stand-in for a shared store: one counter per key.
    #[derive(Default)]
    struct SharedBackend {
        counters: DashMap<String, Arc<LocalCount>>,
    }

    impl CounterBackend for SharedBackend {
        fn counter(&self, key: &str, expiry: CountExpiry) -> Arc<dyn DistributedCount> {
            self.counters
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(LocalCount::new(key, expiry)))
                .value()
                .clone()
        }

        fn name(&self) -> &'static str {
            "shared"
        }
    }

    fn create_registry(limits: Vec<ResourceLimit>) -> Arc<RuleRegistry> {
        let (rules, errors) = RuleSet::from_limits(limits);
        assert!(errors.is_empty(), "invalid test rules: {:?}", errors);
        Arc::new(RuleRegistry::new(rules))
    }

    fn create_limit(resource: &str, dimension: LimitDimension, limit: f64) -> ResourceLimit {
        ResourceLimit::new(resource, dimension, Algorithm::FixedWindow, limit, 60)
    }

    fn create_request(path: &str) -> AdmissionRequest {
        AdmissionRequest::new(Method::GET, path)
            .with_project("proj")
            .with_repo("repo")
    }

    fn create_global_service(
        dimension: LimitDimension,
        backend: Arc<dyn CounterBackend>,
        degrade: DegradePolicy,
        metrics: Arc<InMemoryMetrics>,
    ) -> RateLimiterService {
        let rules = create_registry(vec![
            create_limit("/proj/", LimitDimension::Url, 5.0).with_scope(WorkScope::Global)
        ]);
        RateLimiterService::new(dimension, rules, degrade)
            .with_global_backend(backend)
            .with_store_timeout(Duration::from_millis(50))
            .with_interceptors(InterceptorChain::new().with(Arc::new(MetricsInterceptor::new(metrics.clone()))))
            .with_metrics(metrics)
    }

    #[tokio::test]
    async fn test_check_limit_rejects_over_limit() {
        let rules = create_registry(vec![create_limit("/proj/", LimitDimension::Url, 5.0)]);
        let service = RateLimiterService::new(LimitDimension::Url, rules, DegradePolicy::FailOpen);
        let request = create_request("/proj/repo/a.rpm");

        // Make 5 requests (should all be OK)
        for _ in 0..5 {
            service.check_limit(&request).await.unwrap();
        }

        // 6th request should be over limit
        let err = service.check_limit(&request).await.unwrap_err();
        assert_eq!(
            err,
            AdmissionError::Overload {
                dimension: LimitDimension::Url,
                resource: "/proj/repo/a.rpm".to_string(),
            }
        );
        assert_eq!(service.limiter_count(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_and_ignored_requests_are_admitted() {
        let rules = create_registry(vec![create_limit("/", LimitDimension::UploadUsage, 0.0)]);
        let service = RateLimiterService::new(LimitDimension::UploadUsage, rules.clone(), DegradePolicy::FailClosed);

        // GET does not count against upload usage
        service.check_limit(&create_request("/proj/repo/f")).await.unwrap();

        // A PUT without a length consumes nothing
        let put = AdmissionRequest::new(Method::PUT, "/proj/repo/f").with_project("proj");
        service.check_limit(&put).await.unwrap();
        assert!(service.check_limit(&put.with_content_length(10)).await.is_err());

        let url = RateLimiterService::new(LimitDimension::Url, rules, DegradePolicy::FailClosed);
        url.check_limit(&create_request("/proj/repo/f")).await.unwrap();
        assert_eq!(url.limiter_count(), 0);
    }

    #[tokio::test]
    async fn test_each_path_gets_its_own_limiter() {
        let rules = create_registry(vec![create_limit("/proj/", LimitDimension::Url, 1.0)]);
        let service = RateLimiterService::new(LimitDimension::Url, rules, DegradePolicy::FailOpen);

        service.check_limit(&create_request("/proj/a")).await.unwrap();
        service.check_limit(&create_request("/proj/b")).await.unwrap();
        assert!(service.check_limit(&create_request("/proj/a")).await.is_err());
        assert_eq!(service.limiter_count(), 2);
    }

    #[tokio::test]
    async fn test_dimensions_never_share_state() {
        let backend: Arc<SharedBackend> = Arc::new(SharedBackend::default());
        let rules = create_registry(vec![
            create_limit("/proj/repo/", LimitDimension::Url, 1.0).with_scope(WorkScope::Global),
            create_limit("/proj/repo/", LimitDimension::UrlRepo, 1.0).with_scope(WorkScope::Global),
        ]);
        let url = RateLimiterService::new(LimitDimension::Url, rules.clone(), DegradePolicy::FailOpen)
            .with_global_backend(backend.clone());
        let url_repo = RateLimiterService::new(LimitDimension::UrlRepo, rules, DegradePolicy::FailOpen)
            .with_global_backend(backend.clone());

        // Both dimensions resolve the same literal resource
        let request = create_request("/proj/repo/");
        url.check_limit(&request).await.unwrap();
        url_repo.check_limit(&request).await.unwrap();

        assert!(url.check_limit(&request).await.is_err());
        assert!(url_repo.check_limit(&request).await.is_err());
        assert_eq!(backend.counters.len(), 2);
        assert!(backend.counters.contains_key("floodgate:URL:/proj/repo/"));
        assert!(backend.counters.contains_key("floodgate:URL_REPO:/proj/repo/"));
    }

    #[tokio::test]
    async fn test_global_scope_shared_between_instances() {
        let backend: Arc<SharedBackend> = Arc::new(SharedBackend::default());
        let rules = create_registry(vec![
            create_limit("/proj/", LimitDimension::UrlRepo, 2.0).with_scope(WorkScope::Global)
        ]);
        let first = RateLimiterService::new(LimitDimension::UrlRepo, rules.clone(), DegradePolicy::FailOpen)
            .with_global_backend(backend.clone());
        let second = RateLimiterService::new(LimitDimension::UrlRepo, rules, DegradePolicy::FailOpen)
            .with_global_backend(backend);

        let request = create_request("/proj/repo/x");
        first.check_limit(&request).await.unwrap();
        second.check_limit(&request).await.unwrap();
        assert!(first.check_limit(&request).await.is_err());
    }

    #[tokio::test]
    async fn test_store_failure_fail_open() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let service = create_global_service(
            LimitDimension::Url,
            Arc::new(BrokenBackend { hang: false }),
            DegradePolicy::FailOpen,
            metrics.clone(),
        );

        service.check_limit(&create_request("/proj/a")).await.unwrap();
        assert_eq!(metrics.total(RATE_LIMITER_DEGRADED), 1);
        assert_eq!(metrics.total(RATE_LIMITER_EXCEPTION), 1);
        assert_eq!(metrics.total(RATE_LIMITER_PASS), 0);
    }

    #[tokio::test]
    async fn test_store_failure_fail_closed() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let service = create_global_service(
            LimitDimension::Url,
            Arc::new(BrokenBackend { hang: false }),
            DegradePolicy::FailClosed,
            metrics.clone(),
        );

        let err = service.check_limit(&create_request("/proj/a")).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Degraded { .. }));
        assert_eq!(metrics.total(RATE_LIMITER_DEGRADED), 1);
    }

    #[tokio::test]
    async fn test_hanging_store_is_bounded() {
        for degrade in [DegradePolicy::FailOpen, DegradePolicy::FailClosed] {
            let metrics = Arc::new(InMemoryMetrics::new());
            let service = create_global_service(
                LimitDimension::Url,
                Arc::new(BrokenBackend { hang: true }),
                degrade,
                metrics.clone(),
            );

            let started = Instant::now();
            let result = service.check_limit(&create_request("/proj/a")).await;
            assert!(started.elapsed() < Duration::from_secs(2));

            match degrade {
                DegradePolicy::FailOpen => assert!(result.is_ok()),
                DegradePolicy::FailClosed => assert!(matches!(
                    result,
                    Err(AdmissionError::Degraded {
                        source: CounterError::Timeout(_),
                        ..
                    })
                )),
            }
            assert_eq!(metrics.total(RATE_LIMITER_DEGRADED), 1);
        }
    }

    #[tokio::test]
    async fn test_whitelist_skip_creates_no_limiter() {
        let rules = create_registry(vec![create_limit("/", LimitDimension::UrlRepo, 0.0)]);
        let whitelist = WhitelistInterceptor::new(vec![LimitDimension::UrlRepo], vec!["/trusted/".to_string()]);
        let service = RateLimiterService::new(LimitDimension::UrlRepo, rules, DegradePolicy::FailOpen)
            .with_interceptors(InterceptorChain::new().with(Arc::new(whitelist)));

        let trusted = AdmissionRequest::new(Method::GET, "/trusted/r/x").with_project("trusted");
        service.check_limit(&trusted).await.unwrap();
        assert_eq!(service.limiter_count(), 0);

        let other = create_request("/proj/repo/x");
        let err = service.check_limit(&other).await.unwrap_err();
        assert!(matches!(err, AdmissionError::NotWhitelisted { .. }));
        assert_eq!(err.code(), "WHITELIST_DENIED");
    }

    #[tokio::test]
    async fn test_rule_change_replaces_limiter() {
        let rules = create_registry(vec![create_limit("/proj/", LimitDimension::Url, 1.0)]);
        let service = RateLimiterService::new(LimitDimension::Url, rules.clone(), DegradePolicy::FailOpen);
        let request = create_request("/proj/a");

        service.check_limit(&request).await.unwrap();
        assert!(service.check_limit(&request).await.is_err());

        // Same rule republished: state is kept
        let (same, _) = RuleSet::from_limits(vec![create_limit("/proj/", LimitDimension::Url, 1.0)]);
        rules.replace(same);
        assert!(service.check_limit(&request).await.is_err());

        // Raised limit: a fresh limiter takes over
        let (raised, _) = RuleSet::from_limits(vec![create_limit("/proj/", LimitDimension::Url, 3.0)]);
        rules.replace(raised);
        service.check_limit(&request).await.unwrap();
        assert_eq!(service.limiter_count(), 1);
    }

    #[tokio::test]
    async fn test_usage_aggregate_versus_template() {
        let rules = create_registry(vec![
            create_limit("/proj/", LimitDimension::Usage, 100.0),
            create_limit("/proj/", LimitDimension::UsageTemplate, 100.0),
        ]);
        let usage = RateLimiterService::new(LimitDimension::Usage, rules.clone(), DegradePolicy::FailOpen);
        let template = RateLimiterService::new(LimitDimension::UsageTemplate, rules, DegradePolicy::FailOpen);

        let upload = |repo: &str| {
            AdmissionRequest::new(Method::PUT, format!("/proj/{}/f", repo))
                .with_project("proj")
                .with_repo(repo)
                .with_content_length(60)
        };

        usage.check_limit(&upload("r1")).await.unwrap();
        // Both repositories draw from the one aggregate quota
        assert!(usage.check_limit(&upload("r2")).await.is_err());

        template.check_limit(&upload("r1")).await.unwrap();
        template.check_limit(&upload("r2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let rules = create_registry(vec![ResourceLimit::new(
            "/proj/",
            LimitDimension::Url,
            Algorithm::FixedWindow,
            10.0,
            1,
        )]);
        let service = RateLimiterService::new(LimitDimension::Url, rules, DegradePolicy::FailOpen);

        service.check_limit(&create_request("/proj/a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        service.check_limit(&create_request("/proj/b")).await.unwrap();

        // Only /proj/a has been idle past both the threshold and its 1s window
        assert_eq!(service.evict_idle(Duration::from_millis(40)), 1);
        assert_eq!(service.limiter_count(), 1);

        service.clear();
        assert_eq!(service.limiter_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_first_access_single_instance() {
        let rules = create_registry(vec![create_limit("/proj/", LimitDimension::Url, 20.0)]);
        let service = Arc::new(RateLimiterService::new(LimitDimension::Url, rules, DegradePolicy::FailOpen));

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.check_limit(&create_request("/proj/hot")).await.is_ok() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 20);
        assert_eq!(service.limiter_count(), 1);
    }

    #[tokio::test]
    async fn test_evict_idle_keeps_open_windows() {
        let daily = ResourceLimit::new("/proj/", LimitDimension::UploadUsage, Algorithm::FixedWindow, 1000.0, 1)
            .with_unit(TimeUnit::Day);
        let service =
            RateLimiterService::new(LimitDimension::UploadUsage, create_registry(vec![daily]), DegradePolicy::FailOpen);
        let upload = AdmissionRequest::new(Method::PUT, "/proj/repo/a.rpm")
            .with_project("proj")
            .with_repo("repo")
            .with_content_length(1000);

        service.check_limit(&upload).await.unwrap();
        assert!(service.check_limit(&upload).await.is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(service.evict_idle(Duration::from_millis(10)), 0);

        // Still the same day window, the quota stays spent
        assert!(service.check_limit(&upload).await.is_err());
        assert_eq!(service.limiter_count(), 1);
    }
}
