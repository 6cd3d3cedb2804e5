//! Error types for the Floodgate admission layer.

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

use crate::ratelimit::LimitDimension;

/// Main error type for Floodgate operations outside the request path.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rule could not be registered
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// The shared counter store could not be reached
    #[error("Counter store error: {0}")]
    Store(#[from] CounterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;

/// A malformed or misplaced rate limit rule.
///
/// Raised at registration time; a rule that fails here never reaches
/// request-time checking.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    /// The rule was pushed into a rule tree of another dimension.
    #[error("rule for {resource} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        resource: String,
        expected: LimitDimension,
        actual: LimitDimension,
    },

    /// The resource pattern does not have the shape its dimension requires.
    #[error("invalid resource {resource}: {reason}")]
    InvalidResource { resource: String, reason: String },

    /// Limit, capacity or duration values are out of range.
    #[error("invalid limit for {resource}: {reason}")]
    InvalidLimit { resource: String, reason: String },
}

impl RuleError {
    pub(crate) fn invalid_resource(resource: &str, reason: impl Into<String>) -> Self {
        Self::InvalidResource {
            resource: resource.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_limit(resource: &str, reason: impl Into<String>) -> Self {
        Self::InvalidLimit {
            resource: resource.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure of a counter round trip.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CounterError {
    /// The store did not answer within the configured bound.
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with an error or could not be reached.
    #[error("counter store failure: {0}")]
    Backend(String),
}

impl CounterError {
    /// Short failure class, used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Backend(_) => "backend",
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CounterError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Outcome of a rejected admission check, surfaced to the web layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdmissionError {
    /// The limiter for a dimension denied the permits.
    #[error("{dimension} limit exceeded for {resource}")]
    Overload {
        dimension: LimitDimension,
        resource: String,
    },

    /// A whitelist gate denied a resource that is not on its list.
    #[error("{resource} is not whitelisted for {dimension}")]
    NotWhitelisted {
        dimension: LimitDimension,
        resource: String,
    },

    /// The instance already serves its maximum number of connections.
    #[error("too many concurrent connections (max {max})")]
    ConnectionOverload { max: u64 },

    /// The counter store failed and the degrade policy is fail-closed.
    #[error("{dimension} limit for {resource} unavailable: {source}")]
    Degraded {
        dimension: LimitDimension,
        resource: String,
        source: CounterError,
    },

    /// A pipeline stage was invoked out of order.
    #[error("admission stage {stage} invoked in state {state}")]
    OutOfOrder {
        stage: &'static str,
        state: &'static str,
    },
}

impl AdmissionError {
    /// HTTP status the enclosing web layer should answer with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::OutOfOrder { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Stable diagnostic code, distinct per rejection kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Overload { .. } => "RATE_LIMIT_EXCEEDED",
            Self::NotWhitelisted { .. } => "WHITELIST_DENIED",
            Self::ConnectionOverload { .. } => "CONNECTION_LIMIT_EXCEEDED",
            Self::Degraded { .. } => "RATE_LIMIT_UNAVAILABLE",
            Self::OutOfOrder { .. } => "ADMISSION_OUT_OF_ORDER",
        }
    }

    /// Whether a client may retry the request later.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::OutOfOrder { .. })
    }
}
