//! Rate limit rules: matching, rule sets and periodic refresh.
//!
//! Rules are grouped per dimension into a [`ResourceLimitRule`], which stores
//! them in path tries. A [`RuleSet`] holds the rules of every dimension and is
//! never mutated once published: the [`RuleRegistry`] swaps whole sets, so a
//! lookup sees either the old set or the new one, never a mix.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dimension::LimitDimension;
use super::path::PathNode;
use super::resource::{split_user_resource, ResInfo, ResLimitInfo, ResourceLimit, ANY_MARKER};
use crate::error::{FloodgateError, Result, RuleError};

/// All rules of one dimension.
///
/// Non-user dimensions keep a single path trie. User-scoped dimensions keep
/// one trie per user id, with [`ANY_MARKER`] standing for any user.
#[derive(Debug, Clone)]
pub struct ResourceLimitRule {
    dimension: LimitDimension,
    paths: PathNode,
    users: HashMap<String, PathNode>,
}

impl ResourceLimitRule {
    pub fn new(dimension: LimitDimension) -> Self {
        Self {
            dimension,
            paths: PathNode::new(),
            users: HashMap::new(),
        }
    }

    pub fn dimension(&self) -> LimitDimension {
        self.dimension
    }

    /// Register a limit.
    ///
    /// Rejects limits of another dimension and limits that fail validation.
    /// Disabled limits are accepted and ignored.
    pub fn add_rule(&mut self, limit: ResourceLimit) -> std::result::Result<(), RuleError> {
        if limit.limit_dimension != self.dimension {
            return Err(RuleError::DimensionMismatch {
                resource: limit.resource,
                expected: self.dimension,
                actual: limit.limit_dimension,
            });
        }
        limit.validate()?;
        if !limit.enabled {
            debug!(resource = %limit.resource, dimension = %self.dimension, "Skipping disabled rule");
            return Ok(());
        }

        let limit = Arc::new(limit);
        let replaced = if self.dimension.is_user_scoped() {
            // validate() guarantees the {user}:{path} shape
            let (user, path) = split_user_resource(&limit.resource)
                .ok_or_else(|| RuleError::invalid_resource(&limit.resource, "expected {user}:{path}"))?;
            self.users
                .entry(user.to_string())
                .or_default()
                .insert(path, limit.clone())
        } else {
            self.paths.insert(&limit.resource, limit.clone())
        };

        if replaced.is_some() {
            warn!(resource = %limit.resource, dimension = %self.dimension, "Rule replaced an earlier rule for the same resource");
        }
        Ok(())
    }

    /// Register several limits, stopping at the first invalid one.
    pub fn add_rules<I>(&mut self, limits: I) -> std::result::Result<(), RuleError>
    where
        I: IntoIterator<Item = ResourceLimit>,
    {
        limits.into_iter().try_for_each(|limit| self.add_rule(limit))
    }

    /// Resolve the limit for a request's resource candidates.
    ///
    /// Candidates are tried in order, primary first. For user-scoped
    /// dimensions the request's own user is tried before the any-user rules.
    /// Returns `None` when nothing matches: the request is not limited in
    /// this dimension.
    pub fn get_rate_limit_rule(&self, info: &ResInfo) -> Option<ResLimitInfo> {
        info.candidates().find_map(|candidate| {
            let limit = self.lookup(candidate)?;
            let resource = if self.dimension.shares_rule_state() {
                limit.resource.clone()
            } else {
                candidate.to_string()
            };
            Some(ResLimitInfo {
                resource,
                limit: limit.clone(),
            })
        })
    }

    fn lookup(&self, resource: &str) -> Option<&Arc<ResourceLimit>> {
        if !self.dimension.is_user_scoped() {
            return self.paths.lookup(resource);
        }

        let (user, path) = split_user_resource(resource)?;
        self.users
            .get(user)
            .and_then(|paths| paths.lookup(path))
            .or_else(|| self.users.get(ANY_MARKER).and_then(|paths| paths.lookup(path)))
    }

    /// Number of installed rules.
    pub fn len(&self) -> usize {
        self.paths.len() + self.users.values().map(PathNode::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The rules of every dimension.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: BTreeMap<LimitDimension, ResourceLimitRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a rule set, skipping invalid limits.
    ///
    /// Returns the set together with the errors of the skipped limits.
    pub fn from_limits<I>(limits: I) -> (Self, Vec<RuleError>)
    where
        I: IntoIterator<Item = ResourceLimit>,
    {
        let mut set = Self::new();
        let errors = limits
            .into_iter()
            .filter_map(|limit| set.add_rule(limit).err())
            .collect();
        (set, errors)
    }

    /// Register a limit under its own dimension.
    pub fn add_rule(&mut self, limit: ResourceLimit) -> std::result::Result<(), RuleError> {
        let dimension = limit.limit_dimension;
        self.rules
            .entry(dimension)
            .or_insert_with(|| ResourceLimitRule::new(dimension))
            .add_rule(limit)
    }

    /// The rules of one dimension.
    pub fn rule(&self, dimension: LimitDimension) -> Option<&ResourceLimitRule> {
        self.rules.get(&dimension)
    }

    /// Resolve the limit for `info` in `dimension`.
    pub fn get_rate_limit_rule(&self, dimension: LimitDimension, info: &ResInfo) -> Option<ResLimitInfo> {
        self.rule(dimension)?.get_rate_limit_rule(info)
    }

    /// Number of installed rules across all dimensions.
    pub fn len(&self) -> usize {
        self.rules.values().map(ResourceLimitRule::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holder of the live rule set.
///
/// Readers take a snapshot (`Arc` clone) and release the lock immediately.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    current: RwLock<Arc<RuleSet>>,
}

impl RuleRegistry {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(rules)),
        }
    }

    /// The rule set as of now.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.read().clone()
    }

    /// Publish a new rule set, returning the one it replaced.
    pub fn replace(&self, rules: RuleSet) -> Arc<RuleSet> {
        let rules = Arc::new(rules);
        info!(rules = rules.len(), "Installing rule set");
        std::mem::replace(&mut *self.current.write(), rules)
    }

    /// Add one rule by publishing a copy of the live set that includes it.
    pub fn add_rule(&self, limit: ResourceLimit) -> std::result::Result<(), RuleError> {
        self.add_rules(std::iter::once(limit))
    }

    /// Add several rules in one swap. Nothing is published if any is invalid.
    pub fn add_rules<I>(&self, limits: I) -> std::result::Result<(), RuleError>
    where
        I: IntoIterator<Item = ResourceLimit>,
    {
        let mut current = self.current.write();
        let mut next = RuleSet::clone(&current);
        for limit in limits {
            next.add_rule(limit)?;
        }
        *current = Arc::new(next);
        Ok(())
    }
}

/// On-disk rule file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<ResourceLimit>,
}

impl RuleFile {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }
}

/// Where rule definitions come from.
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Fetch the complete list of rule definitions.
    async fn load(&self) -> Result<Vec<ResourceLimit>>;

    /// Human-readable name for logging.
    fn describe(&self) -> String;
}

/// Rules read from a YAML file on every refresh.
#[derive(Debug, Clone)]
pub struct FileRuleSource {
    path: PathBuf,
}

impl FileRuleSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RuleSource for FileRuleSource {
    async fn load(&self) -> Result<Vec<ResourceLimit>> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        Ok(RuleFile::from_yaml(&contents)?.rules)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Rules held in memory, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticRuleSource {
    limits: Mutex<Vec<ResourceLimit>>,
}

impl StaticRuleSource {
    pub fn new(limits: Vec<ResourceLimit>) -> Self {
        Self {
            limits: Mutex::new(limits),
        }
    }

    /// Replace the rules served from the next load on.
    pub fn set(&self, limits: Vec<ResourceLimit>) {
        *self.limits.lock() = limits;
    }
}

#[async_trait]
impl RuleSource for StaticRuleSource {
    async fn load(&self) -> Result<Vec<ResourceLimit>> {
        Ok(self.limits.lock().clone())
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

/// Rebuilds the live rule set from a source.
pub struct RuleRefresher {
    source: Arc<dyn RuleSource>,
    registry: Arc<RuleRegistry>,
}

impl RuleRefresher {
    pub fn new(source: Arc<dyn RuleSource>, registry: Arc<RuleRegistry>) -> Self {
        Self { source, registry }
    }

    /// Load the source and publish a fresh rule set.
    ///
    /// Invalid rules are skipped with a warning. If the source itself fails,
    /// the live set stays in place and the error is returned.
    /// Returns the number of rules installed.
    pub async fn refresh_once(&self) -> Result<usize> {
        let limits = self.source.load().await?;
        let (rules, errors) = RuleSet::from_limits(limits);
        for error in &errors {
            warn!(source = %self.source.describe(), error = %error, "Skipping invalid rule");
        }

        let installed = rules.len();
        self.registry.replace(rules);
        Ok(installed)
    }

    /// Refresh every `interval` until the task is aborted.
    ///
    /// The first refresh happens immediately.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh_once().await {
                    warn!(source = %self.source.describe(), error = %e, "Rule refresh failed, keeping current rules");
                }
            }
        })
    }
}
