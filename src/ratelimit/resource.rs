//! Resource limits and resolved resource/limit pairings.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::algorithm::Algorithm;
use super::dimension::LimitDimension;
use crate::error::RuleError;

/// Marker segment matching any user, or any value of a path segment.
pub const ANY_MARKER: &str = "*";

/// Separator between the user id and the path of user-scoped resources.
pub const USER_SEPARATOR: char = ':';

/// Time unit for rule durations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[default]
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// Where a rule's limiter state lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkScope {
    /// Per instance, always in process memory
    #[default]
    Local,
    /// Shared by all instances through the deployment's counter store
    Global,
}

/// A configured limit: what is limited, and how.
///
/// Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimit {
    /// Resource pattern, in the key shape of `limit_dimension`
    pub resource: String,
    /// The dimension this limit belongs to
    pub limit_dimension: LimitDimension,
    /// Admission algorithm
    pub algorithm: Algorithm,
    /// Permits per window (fixed window) or per window as a rate (buckets)
    pub limit: f64,
    /// Window length, in `unit`s
    #[serde(default = "default_duration")]
    pub duration: u64,
    /// Unit of `duration`
    #[serde(default)]
    pub unit: TimeUnit,
    /// Bucket capacity; defaults to `limit`
    #[serde(default)]
    pub capacity: Option<f64>,
    /// Where limiter state is kept
    #[serde(default)]
    pub scope: WorkScope,
    /// Disabled rules are accepted but never installed
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_duration() -> u64 {
    1
}

fn default_enabled() -> bool {
    true
}

impl ResourceLimit {
    /// Create an enabled, locally scoped limit of `limit` permits per `duration` seconds.
    pub fn new(
        resource: impl Into<String>,
        limit_dimension: LimitDimension,
        algorithm: Algorithm,
        limit: f64,
        duration: u64,
    ) -> Self {
        Self {
            resource: resource.into(),
            limit_dimension,
            algorithm,
            limit,
            duration,
            unit: TimeUnit::Second,
            capacity: None,
            scope: WorkScope::Local,
            enabled: true,
        }
    }

    /// Set an explicit bucket capacity.
    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set the unit of `duration`.
    pub fn with_unit(mut self, unit: TimeUnit) -> Self {
        self.unit = unit;
        self
    }

    /// Set the work scope.
    pub fn with_scope(mut self, scope: WorkScope) -> Self {
        self.scope = scope;
        self
    }

    /// The window length.
    pub fn window(&self) -> Duration {
        self.unit.duration() * self.duration as u32
    }

    /// Refill/leak rate in permits per second.
    pub fn rate(&self) -> f64 {
        self.limit / self.window().as_secs_f64()
    }

    /// Bucket capacity.
    pub fn bucket_capacity(&self) -> f64 {
        self.capacity.unwrap_or(self.limit)
    }

    /// Check numeric ranges and the resource shape for this limit's dimension.
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.duration == 0 || self.duration > u64::from(u32::MAX) {
            return Err(RuleError::invalid_limit(&self.resource, "duration out of range"));
        }
        if !self.limit.is_finite() || self.limit < 0.0 {
            return Err(RuleError::invalid_limit(
                &self.resource,
                format!("limit must be a non-negative number, got {}", self.limit),
            ));
        }
        if self.algorithm.is_bucket() {
            if self.limit <= 0.0 {
                return Err(RuleError::invalid_limit(&self.resource, "bucket rate must be positive"));
            }
            let capacity = self.bucket_capacity();
            if !capacity.is_finite() || capacity <= 0.0 {
                return Err(RuleError::invalid_limit(
                    &self.resource,
                    format!("bucket capacity must be positive, got {}", capacity),
                ));
            }
        }

        if self.limit_dimension.is_user_scoped() {
            let (user, path) = split_user_resource(&self.resource).ok_or_else(|| {
                RuleError::invalid_resource(&self.resource, "expected {user}:{path}")
            })?;
            if user.is_empty() {
                return Err(RuleError::invalid_resource(&self.resource, "empty user"));
            }
            check_path(&self.resource, path)
        } else {
            check_path(&self.resource, &self.resource)
        }
    }
}

fn check_path(resource: &str, path: &str) -> Result<(), RuleError> {
    if !path.starts_with('/') {
        return Err(RuleError::invalid_resource(resource, "path must start with '/'"));
    }
    Ok(())
}

/// Split a user-scoped resource into its user id and path.
///
/// Paths start with `/`, so the split happens at the first separator followed
/// by one. User ids may themselves contain the separator (`corp:alice`).
pub fn split_user_resource(resource: &str) -> Option<(&str, &str)> {
    let (at, _) = resource
        .match_indices(USER_SEPARATOR)
        .find(|(at, _)| resource[at + USER_SEPARATOR.len_utf8()..].starts_with('/'))?;
    Some((&resource[..at], &resource[at + USER_SEPARATOR.len_utf8()..]))
}

/// Join a user id and a path into a user-scoped resource.
pub fn user_resource(user: &str, path: &str) -> String {
    format!("{}{}{}", user, USER_SEPARATOR, path)
}

/// The resource candidates derived from one request for one dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResInfo {
    /// Primary resource key
    pub resource: String,
    /// Fallback keys, tried in order when the primary key matches nothing
    pub extra_resources: Vec<String>,
}

impl ResInfo {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            extra_resources: Vec::new(),
        }
    }

    pub fn with_extra(mut self, extra: Vec<String>) -> Self {
        self.extra_resources = extra;
        self
    }

    /// All candidates, primary first.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.resource.as_str()).chain(self.extra_resources.iter().map(String::as_str))
    }
}

/// A request resource paired with the limit it resolved to.
#[derive(Debug, Clone, PartialEq)]
pub struct ResLimitInfo {
    /// The resource whose limiter state is consumed
    pub resource: String,
    /// The matched limit, after prefix inheritance
    pub limit: Arc<ResourceLimit>,
}

/// Build the counter-store key for a resolved resource.
///
/// Format: `{namespace}:{dimension}:{resource}`. The dimension segment keeps
/// identical resource strings of different dimensions apart.
pub fn generate_key(namespace: &str, resource: &str, limit: &ResourceLimit) -> String {
    format!("{}:{}:{}", namespace, limit.limit_dimension, resource)
}
