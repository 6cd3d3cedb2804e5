//! Limit dimensions: the independent axes requests are limited along.

use http::Method;
use serde::{Deserialize, Serialize};

/// An independent axis of rate limiting.
///
/// Each dimension has its own resource-key shape, its own permit unit and
/// fully isolated limiter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitDimension {
    /// Request count per URL path
    Url,
    /// Request count per project/repository
    UrlRepo,
    /// Request count per user and URL path
    UserUrl,
    /// Request count per user and project/repository
    UserUrlRepo,
    /// Bytes uploaded per project/repository
    UploadUsage,
    /// Bytes downloaded per project/repository
    DownloadUsage,
    /// Upload throughput per project/repository
    UploadBandwidth,
    /// Download throughput per project/repository
    DownloadBandwidth,
    /// Bytes transferred in either direction, one shared quota per rule
    Usage,
    /// Bytes transferred in either direction, one quota per concrete repository
    UsageTemplate,
}

/// The unit a dimension consumes per admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitUnit {
    /// One permit per request
    Requests,
    /// One permit per transferred byte
    Bytes,
}

impl LimitDimension {
    /// All dimensions, in declaration order.
    pub const ALL: [LimitDimension; 10] = [
        LimitDimension::Url,
        LimitDimension::UrlRepo,
        LimitDimension::UserUrl,
        LimitDimension::UserUrlRepo,
        LimitDimension::UploadUsage,
        LimitDimension::DownloadUsage,
        LimitDimension::UploadBandwidth,
        LimitDimension::DownloadBandwidth,
        LimitDimension::Usage,
        LimitDimension::UsageTemplate,
    ];

    /// The configuration name of this dimension.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitDimension::Url => "URL",
            LimitDimension::UrlRepo => "URL_REPO",
            LimitDimension::UserUrl => "USER_URL",
            LimitDimension::UserUrlRepo => "USER_URL_REPO",
            LimitDimension::UploadUsage => "UPLOAD_USAGE",
            LimitDimension::DownloadUsage => "DOWNLOAD_USAGE",
            LimitDimension::UploadBandwidth => "UPLOAD_BANDWIDTH",
            LimitDimension::DownloadBandwidth => "DOWNLOAD_BANDWIDTH",
            LimitDimension::Usage => "USAGE",
            LimitDimension::UsageTemplate => "USAGE_TEMPLATE",
        }
    }

    /// Whether resources of this dimension are prefixed by a user id.
    ///
    /// User-scoped dimensions can only be checked after authentication.
    pub fn is_user_scoped(&self) -> bool {
        matches!(self, LimitDimension::UserUrl | LimitDimension::UserUrlRepo)
    }

    /// What one permit of this dimension stands for.
    pub fn permit_unit(&self) -> PermitUnit {
        match self {
            LimitDimension::Url
            | LimitDimension::UrlRepo
            | LimitDimension::UserUrl
            | LimitDimension::UserUrlRepo => PermitUnit::Requests,
            _ => PermitUnit::Bytes,
        }
    }

    /// Whether all resources matching one rule share a single limiter.
    ///
    /// Every other dimension keeps one limiter per concrete resource, with
    /// the matched rule only supplying the numbers.
    pub fn shares_rule_state(&self) -> bool {
        matches!(self, LimitDimension::Usage)
    }

    /// Whether requests with `method` count against this dimension.
    pub fn meters_method(&self, method: &Method) -> bool {
        let upload = *method == Method::PUT || *method == Method::POST;
        let download = *method == Method::GET;

        match self {
            LimitDimension::UploadUsage | LimitDimension::UploadBandwidth => upload,
            LimitDimension::DownloadUsage | LimitDimension::DownloadBandwidth => download,
            LimitDimension::Usage | LimitDimension::UsageTemplate => upload || download,
            _ => true,
        }
    }
}

impl std::fmt::Display for LimitDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LimitDimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LimitDimension::ALL
            .iter()
            .copied()
            .find(|d| d.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown limit dimension: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_names_round_trip_through_serde() {
        for dimension in LimitDimension::ALL {
            let yaml = serde_yaml::to_string(&dimension).unwrap();
            assert_eq!(yaml.trim(), dimension.as_str());
            let parsed: LimitDimension = serde_yaml::from_str(&yaml).unwrap();
            assert_eq!(parsed, dimension);
        }
    }

    #[test]
    fn test_user_scoped_dimensions() {
        assert!(LimitDimension::UserUrl.is_user_scoped());
        assert!(LimitDimension::UserUrlRepo.is_user_scoped());
        assert!(!LimitDimension::Url.is_user_scoped());
        assert!(!LimitDimension::UploadUsage.is_user_scoped());
    }

    #[test]
    fn test_permit_units() {
        assert_eq!(LimitDimension::Url.permit_unit(), PermitUnit::Requests);
        assert_eq!(LimitDimension::UserUrlRepo.permit_unit(), PermitUnit::Requests);
        assert_eq!(LimitDimension::UploadUsage.permit_unit(), PermitUnit::Bytes);
        assert_eq!(LimitDimension::DownloadBandwidth.permit_unit(), PermitUnit::Bytes);
    }

    #[test]
    fn test_metered_methods() {
        assert!(LimitDimension::UploadUsage.meters_method(&Method::PUT));
        assert!(!LimitDimension::UploadUsage.meters_method(&Method::GET));
        assert!(LimitDimension::DownloadBandwidth.meters_method(&Method::GET));
        assert!(!LimitDimension::DownloadBandwidth.meters_method(&Method::POST));
        assert!(LimitDimension::Usage.meters_method(&Method::GET));
        assert!(!LimitDimension::Usage.meters_method(&Method::DELETE));
        assert!(LimitDimension::Url.meters_method(&Method::DELETE));
    }

    #[test]
    fn test_from_str() {
        assert_eq!("url_repo".parse::<LimitDimension>(), Ok(LimitDimension::UrlRepo));
        assert!("bogus".parse::<LimitDimension>().is_err());
    }
}
