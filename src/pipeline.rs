//! Request admission pipeline.
//!
//! Composes the connection gate and the dimension services into the order a
//! request passes through them:
//!
//! ```text
//! Arrived -> ConnectionAdmitted -> NonUserChecked -> Authenticated -> UserChecked -> Handled -> Released
//! ```
//!
//! Any failed check moves the request to `Rejected` and gives its connection
//! slot back. Within a stage, dimensions run in their configured order and
//! the first rejection ends the stage.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::{RateLimitingConfig, StoreBackend, StoreConfig};
use crate::error::{AdmissionError, FloodgateError, Result};
use crate::ratelimit::{
    AdmissionRequest, ConnectionLimiter, ConnectionPermit, CounterBackend, InterceptorChain, LimitDimension,
    LocalBackend, MetricsInterceptor, MetricsRecorder, RateLimiterService, RuleRegistry,
    WhitelistInterceptor,
};

/// Where a request is in the admission pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    Arrived,
    ConnectionAdmitted,
    NonUserChecked,
    Authenticated,
    UserChecked,
    Handled,
    Rejected,
    Released,
}

impl AdmissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionState::Arrived => "arrived",
            AdmissionState::ConnectionAdmitted => "connection_admitted",
            AdmissionState::NonUserChecked => "non_user_checked",
            AdmissionState::Authenticated => "authenticated",
            AdmissionState::UserChecked => "user_checked",
            AdmissionState::Handled => "handled",
            AdmissionState::Rejected => "rejected",
            AdmissionState::Released => "released",
        }
    }
}

impl std::fmt::Display for AdmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request-scoped admission state.
///
/// Holds the request's connection slot. The slot is released exactly once:
/// on rejection, on [`complete`](Self::complete), or when the context is
/// dropped, whichever comes first.
#[derive(Debug)]
pub struct AdmissionContext {
    state: AdmissionState,
    permit: Option<ConnectionPermit>,
    started: Instant,
}

impl AdmissionContext {
    fn new() -> Self {
        Self {
            state: AdmissionState::Arrived,
            permit: None,
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> AdmissionState {
        self.state
    }

    /// Time since the request arrived.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn require(&self, stage: &'static str, state: AdmissionState) -> std::result::Result<(), AdmissionError> {
        if self.state == state {
            Ok(())
        } else {
            Err(AdmissionError::OutOfOrder {
                stage,
                state: self.state.as_str(),
            })
        }
    }

    fn reject(&mut self, error: AdmissionError) -> AdmissionError {
        self.state = AdmissionState::Rejected;
        self.release();
        error
    }

    fn release(&mut self) {
        if let Some(permit) = self.permit.take() {
            permit.release();
        }
    }

    /// Mark the request handled and release its connection slot.
    pub fn complete(&mut self) -> std::result::Result<Duration, AdmissionError> {
        self.require("complete", AdmissionState::UserChecked)?;
        self.state = AdmissionState::Handled;
        self.release();
        self.state = AdmissionState::Released;
        Ok(self.elapsed())
    }
}

/// The admission layer in front of request handling.
pub struct AdmissionPipeline {
    connections: Arc<ConnectionLimiter>,
    non_user: Vec<Arc<RateLimiterService>>,
    user: Vec<Arc<RateLimiterService>>,
    transfer: Vec<Arc<RateLimiterService>>,
}

impl AdmissionPipeline {
    /// Assemble a pipeline from explicit parts.
    pub fn new(
        connections: Arc<ConnectionLimiter>,
        non_user: Vec<Arc<RateLimiterService>>,
        user: Vec<Arc<RateLimiterService>>,
        transfer: Vec<Arc<RateLimiterService>>,
    ) -> Self {
        Self {
            connections,
            non_user,
            user,
            transfer,
        }
    }

    /// Build the services configured in `config`.
    ///
    /// A disabled configuration yields a pipeline that admits everything.
    pub fn from_config(
        config: &RateLimitingConfig,
        rules: Arc<RuleRegistry>,
        global: Arc<dyn CounterBackend>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        if !config.enabled {
            info!("Rate limiting disabled, admitting all requests");
            return Self::new(Arc::new(ConnectionLimiter::unlimited()), vec![], vec![], vec![]);
        }

        let mut interceptors = InterceptorChain::new();
        if let Some(whitelist) = &config.whitelist {
            interceptors.push(Arc::new(WhitelistInterceptor::new(
                whitelist.dimensions.clone(),
                whitelist.entries.clone(),
            )));
        }
        interceptors.push(Arc::new(MetricsInterceptor::new(metrics.clone())));

        let build = |dimensions: &[LimitDimension]| -> Vec<Arc<RateLimiterService>> {
            dimensions
                .iter()
                .map(|dimension| {
                    Arc::new(
                        RateLimiterService::new(*dimension, rules.clone(), config.degrade)
                            .with_namespace(config.namespace.clone())
                            .with_global_backend(global.clone())
                            .with_store_timeout(config.store_timeout())
                            .with_interceptors(interceptors.clone())
                            .with_metrics(metrics.clone()),
                    )
                })
                .collect()
        };

        let pipeline = Self::new(
            Arc::new(ConnectionLimiter::new(config.max_connections, metrics.clone())),
            build(&config.non_user_dimensions),
            build(&config.user_dimensions),
            build(&config.transfer_dimensions),
        );
        info!(
            non_user = ?config.non_user_dimensions,
            user = ?config.user_dimensions,
            transfer = ?config.transfer_dimensions,
            max_connections = config.max_connections,
            backend = global.name(),
            "Admission pipeline ready"
        );
        pipeline
    }

    /// Admit a new request: take a connection slot, then run the checks that
    /// need no user.
    ///
    /// On rejection the slot has already been released.
    pub async fn admit(&self, request: &AdmissionRequest) -> std::result::Result<AdmissionContext, AdmissionError> {
        let mut ctx = AdmissionContext::new();
        ctx.permit = Some(self.connections.try_acquire()?);
        ctx.state = AdmissionState::ConnectionAdmitted;

        if let Err(error) = run_checks(&self.non_user, request, None).await {
            return Err(ctx.reject(error));
        }
        ctx.state = AdmissionState::NonUserChecked;
        Ok(ctx)
    }

    /// Run the user-scoped checks once identity has been resolved.
    pub async fn authenticate(
        &self,
        ctx: &mut AdmissionContext,
        request: &AdmissionRequest,
    ) -> std::result::Result<(), AdmissionError> {
        ctx.require("authenticate", AdmissionState::NonUserChecked)?;
        ctx.state = AdmissionState::Authenticated;

        if let Err(error) = run_checks(&self.user, request, None).await {
            return Err(ctx.reject(error));
        }
        ctx.state = AdmissionState::UserChecked;
        Ok(())
    }

    /// Charge `bytes` of a transfer against the transfer dimensions.
    pub async fn check_transfer(
        &self,
        ctx: &mut AdmissionContext,
        request: &AdmissionRequest,
        bytes: u64,
    ) -> std::result::Result<(), AdmissionError> {
        ctx.require("check_transfer", AdmissionState::UserChecked)?;

        if let Err(error) = run_checks(&self.transfer, request, Some(bytes)).await {
            return Err(ctx.reject(error));
        }
        Ok(())
    }

    /// Drop idle limiters across all services.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        self.services().map(|service| service.evict_idle(idle)).sum()
    }

    /// Live limiter instances across all services.
    pub fn limiter_count(&self) -> usize {
        self.services().map(|service| service.limiter_count()).sum()
    }

    pub fn connections(&self) -> &Arc<ConnectionLimiter> {
        &self.connections
    }

    fn services(&self) -> impl Iterator<Item = &Arc<RateLimiterService>> {
        self.non_user.iter().chain(&self.user).chain(&self.transfer)
    }
}

async fn run_checks(
    services: &[Arc<RateLimiterService>],
    request: &AdmissionRequest,
    permits: Option<u64>,
) -> std::result::Result<(), AdmissionError> {
    for service in services {
        if let Err(error) = service.check_limit_with_permits(request, permits).await {
            debug!(dimension = %service.dimension(), path = %request.path, error = %error, "Request rejected");
            return Err(error);
        }
    }
    Ok(())
}

/// Create the counter backend for globally scoped rules.
pub async fn connect_store(store: &StoreConfig) -> Result<Arc<dyn CounterBackend>> {
    match store.backend {
        StoreBackend::Local => Ok(Arc::new(LocalBackend)),
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let url = store
                .redis_url
                .as_deref()
                .ok_or_else(|| FloodgateError::Config("store.redis_url is not set".to_string()))?;
            let backend = crate::ratelimit::RedisBackend::connect(url).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => Err(FloodgateError::Config(
            "redis store requested but floodgate was built without the `redis` feature".to_string(),
        )),
    }
}
