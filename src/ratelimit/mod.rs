//! Rate limiting logic and state management.

pub mod algorithm;
mod backend;
mod connection;
mod counter;
mod dimension;
#[cfg(feature = "redis")]
mod distributed;
mod interceptor;
mod limiter;
pub mod metrics;
mod path;
mod request;
mod resource;
mod rules;
mod strategy;

pub use algorithm::{build_algorithm, Algorithm, RateLimitAlgorithm};
pub use backend::{CounterBackend, LocalBackend};
pub use connection::{ConnectionLimiter, ConnectionPermit};
pub use counter::{CountExpiry, CounterResult, DistributedCount, LocalCount};
pub use dimension::{LimitDimension, PermitUnit};
#[cfg(feature = "redis")]
pub use distributed::{RedisBackend, RedisCount};
pub use interceptor::{
    CheckOutcome, InterceptorChain, LimitCheck, MetricsInterceptor, PreCheck, RateLimiterInterceptor,
    WhitelistInterceptor,
};
pub use limiter::{DegradePolicy, RateLimiterService, DEFAULT_NAMESPACE, DEFAULT_STORE_TIMEOUT};
#[cfg(test)]
pub(crate) use self::metrics::InMemoryMetrics;
pub use self::metrics::{FacadeMetrics, MetricsRecorder, NoopMetrics};
pub use path::PathNode;
pub use request::{AdmissionRequest, ANONYMOUS_USER};
pub use resource::{
    generate_key, split_user_resource, user_resource, ResInfo, ResLimitInfo, ResourceLimit, TimeUnit,
    WorkScope, ANY_MARKER, USER_SEPARATOR,
};
pub use rules::{
    FileRuleSource, ResourceLimitRule, RuleFile, RuleRefresher, RuleRegistry, RuleSet, RuleSource,
    StaticRuleSource,
};
pub use strategy::{
    strategy_for, DimensionStrategy, TransferStrategy, UrlRepoStrategy, UrlStrategy, UserUrlRepoStrategy,
    UserUrlStrategy,
};
