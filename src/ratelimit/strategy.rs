//! Per-dimension request shaping.
//!
//! A [`DimensionStrategy`] turns a request into the resource keys, exemption
//! decision and permit count of one dimension. Key shapes:
//!
//! | Dimension | Resource | Extra candidates |
//! |---|---|---|
//! | `URL` | request path | `/{project}/{repo}/` when the path is outside it |
//! | `URL_REPO` | `/{project}/{repo}/` | |
//! | `USER_URL` | `{user}:{path}` | `{user}:/{project}/{repo}/` |
//! | `USER_URL_REPO` | `{user}:/{project}/{repo}/` | |
//! | byte dimensions | `/{project}/{repo}/` | |

use std::sync::Arc;
use tracing::warn;

use super::dimension::{LimitDimension, PermitUnit};
use super::request::AdmissionRequest;
use super::resource::user_resource;

/// How one dimension reads a request.
pub trait DimensionStrategy: Send + Sync {
    /// The dimension this strategy shapes requests for.
    fn dimension(&self) -> LimitDimension;

    /// Primary resource key, or `None` if the request has none in this dimension.
    fn build_resource(&self, request: &AdmissionRequest) -> Option<String>;

    /// Fallback resource keys, tried in order when the primary key matches no rule.
    fn build_extra_resources(&self, _request: &AdmissionRequest) -> Vec<String> {
        Vec::new()
    }

    /// Whether this dimension does not apply to the request at all.
    fn ignore_request(&self, _request: &AdmissionRequest) -> bool {
        false
    }

    /// Permits this request consumes.
    ///
    /// `supplied` overrides the request-derived amount, e.g. for a chunk of a
    /// streamed transfer.
    fn apply_permits(&self, _request: &AdmissionRequest, supplied: Option<u64>) -> u64 {
        supplied.unwrap_or(1)
    }
}

/// Request count per URL path.
#[derive(Debug, Default, Clone, Copy)]
pub struct UrlStrategy;

impl DimensionStrategy for UrlStrategy {
    fn dimension(&self) -> LimitDimension {
        LimitDimension::Url
    }

    fn build_resource(&self, request: &AdmissionRequest) -> Option<String> {
        Some(request.path.clone())
    }

    fn build_extra_resources(&self, request: &AdmissionRequest) -> Vec<String> {
        request
            .repo_path()
            .filter(|repo| !request.path.starts_with(repo.as_str()))
            .into_iter()
            .collect()
    }
}

/// Request count per project/repository.
#[derive(Debug, Default, Clone, Copy)]
pub struct UrlRepoStrategy;

impl DimensionStrategy for UrlRepoStrategy {
    fn dimension(&self) -> LimitDimension {
        LimitDimension::UrlRepo
    }

    fn build_resource(&self, request: &AdmissionRequest) -> Option<String> {
        request.repo_path()
    }

    fn ignore_request(&self, request: &AdmissionRequest) -> bool {
        request.repo_path().is_none()
    }
}

/// Request count per user and URL path.
#[derive(Debug, Default, Clone, Copy)]
pub struct UserUrlStrategy;

impl DimensionStrategy for UserUrlStrategy {
    fn dimension(&self) -> LimitDimension {
        LimitDimension::UserUrl
    }

    fn build_resource(&self, request: &AdmissionRequest) -> Option<String> {
        Some(user_resource(request.user(), &request.path))
    }

    fn build_extra_resources(&self, request: &AdmissionRequest) -> Vec<String> {
        request
            .repo_path()
            .filter(|repo| !request.path.starts_with(repo.as_str()))
            .map(|repo| user_resource(request.user(), &repo))
            .into_iter()
            .collect()
    }
}

/// Request count per user and project/repository.
#[derive(Debug, Default, Clone, Copy)]
pub struct UserUrlRepoStrategy;

impl DimensionStrategy for UserUrlRepoStrategy {
    fn dimension(&self) -> LimitDimension {
        LimitDimension::UserUrlRepo
    }

    fn build_resource(&self, request: &AdmissionRequest) -> Option<String> {
        request
            .repo_path()
            .map(|repo| user_resource(request.user(), &repo))
    }

    fn ignore_request(&self, request: &AdmissionRequest) -> bool {
        request.repo_path().is_none()
    }
}

/// Bytes moved per project/repository, for every byte dimension.
#[derive(Debug, Clone, Copy)]
pub struct TransferStrategy {
    dimension: LimitDimension,
}

impl TransferStrategy {
    /// Returns `None` for dimensions that do not count bytes.
    pub fn new(dimension: LimitDimension) -> Option<Self> {
        (dimension.permit_unit() == PermitUnit::Bytes).then_some(Self { dimension })
    }
}

impl DimensionStrategy for TransferStrategy {
    fn dimension(&self) -> LimitDimension {
        self.dimension
    }

    fn build_resource(&self, request: &AdmissionRequest) -> Option<String> {
        request.repo_path()
    }

    fn ignore_request(&self, request: &AdmissionRequest) -> bool {
        !self.dimension.meters_method(&request.method) || request.repo_path().is_none()
    }

    fn apply_permits(&self, request: &AdmissionRequest, supplied: Option<u64>) -> u64 {
        if let Some(permits) = supplied {
            return permits;
        }
        match request.declared_length() {
            Some(length) => length,
            None => {
                warn!(
                    dimension = %self.dimension,
                    path = %request.path,
                    content_length = ?request.content_length,
                    "No usable Content-Length, counting 0 bytes"
                );
                0
            }
        }
    }
}

/// The strategy for `dimension`.
pub fn strategy_for(dimension: LimitDimension) -> Arc<dyn DimensionStrategy> {
    match dimension {
        LimitDimension::Url => Arc::new(UrlStrategy),
        LimitDimension::UrlRepo => Arc::new(UrlRepoStrategy),
        LimitDimension::UserUrl => Arc::new(UserUrlStrategy),
        LimitDimension::UserUrlRepo => Arc::new(UserUrlRepoStrategy),
        _ => Arc::new(TransferStrategy { dimension }),
    }
}
