//! The request attributes admission decisions are derived from.

use http::Method;
use serde::Serialize;

/// User id substituted for requests without an authenticated user.
pub const ANONYMOUS_USER: &str = "anonymous";

/// An incoming request, as seen by the admission layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionRequest {
    #[serde(serialize_with = "serialize_method")]
    pub method: Method,
    /// Request path, starting with `/`
    pub path: String,
    pub project_id: Option<String>,
    pub repo_name: Option<String>,
    /// Authenticated user, if identity has been resolved
    pub user_id: Option<String>,
    /// Declared body length; `-1` when the client sent none
    pub content_length: Option<i64>,
}

fn serialize_method<S: serde::Serializer>(method: &Method, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(method.as_str())
}

impl AdmissionRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        Self {
            method,
            path,
            project_id: None,
            repo_name: None,
            user_id: None,
            content_length: None,
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_repo(mut self, repo_name: impl Into<String>) -> Self {
        self.repo_name = Some(repo_name.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_content_length(mut self, content_length: i64) -> Self {
        self.content_length = Some(content_length);
        self
    }

    /// The user id, or [`ANONYMOUS_USER`].
    pub fn user(&self) -> &str {
        self.user_id
            .as_deref()
            .filter(|user| !user.is_empty())
            .unwrap_or(ANONYMOUS_USER)
    }

    /// `/{project}/{repo}/`, or `/{project}/` without a repository.
    ///
    /// `None` when the request does not address a project.
    pub fn repo_path(&self) -> Option<String> {
        let project = self.project_id.as_deref().filter(|p| !p.is_empty())?;
        Some(match self.repo_name.as_deref().filter(|r| !r.is_empty()) {
            Some(repo) => format!("/{}/{}/", project, repo),
            None => format!("/{}/", project),
        })
    }

    /// Body length in bytes, when the client declared one.
    pub fn declared_length(&self) -> Option<u64> {
        self.content_length
            .filter(|len| *len >= 0)
            .map(|len| len as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_user() {
        let request = AdmissionRequest::new(Method::GET, "/a");
        assert_eq!(request.user(), ANONYMOUS_USER);
        assert_eq!(request.clone().with_user("").user(), ANONYMOUS_USER);
        assert_eq!(request.with_user("alice").user(), "alice");
    }

    #[test]
    fn test_repo_path() {
        let request = AdmissionRequest::new(Method::GET, "p/r/file");
        assert_eq!(request.path, "/p/r/file");
        assert_eq!(request.repo_path(), None);

        let request = request.with_project("p");
        assert_eq!(request.repo_path().as_deref(), Some("/p/"));
        assert_eq!(request.with_repo("r").repo_path().as_deref(), Some("/p/r/"));
    }

    #[test]
    fn test_declared_length() {
        let request = AdmissionRequest::new(Method::PUT, "/p/r/f");
        assert_eq!(request.declared_length(), None);
        assert_eq!(request.clone().with_content_length(-1).declared_length(), None);
        assert_eq!(request.with_content_length(42).declared_length(), Some(42));
    }
}
