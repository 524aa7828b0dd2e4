//! The HTTP response head shared by every stage of a request.
//!
//! The status starts out unset. Hooks and content handlers set it; the host
//! turns an unset status after content generation into a 500.

use http::{HeaderMap, StatusCode, Version};

/// An HTTP response head.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    version: Version,
    status: Option<StatusCode>,
    reason: Option<String>,
    headers: HeaderMap,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Returns the status, or `None` while no stage has set one.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    /// Sets status and an explicit reason phrase in one go.
    pub fn set_status_line(&mut self, status: StatusCode, reason: impl Into<String>) {
        self.status = Some(status);
        self.reason = Some(reason.into());
    }

    /// Returns the explicit reason phrase, falling back to the canonical one.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref().or_else(|| self.status.and_then(|s| s.canonical_reason()))
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Returns whether the status is a client or server error.
    pub fn is_error(&self) -> bool {
        self.status.is_some_and(|s| s.is_client_error() || s.is_server_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_starts_unset() {
        let response = HttpResponse::new();
        assert_eq!(response.status(), None);
        assert_eq!(response.reason(), None);
        assert!(!response.is_error());
    }

    #[test]
    fn test_reason_falls_back_to_canonical() {
        let mut response = HttpResponse::new();
        response.set_status(StatusCode::NOT_FOUND);
        assert_eq!(response.reason(), Some("Not Found"));
        assert!(response.is_error());

        response.set_status_line(StatusCode::OK, "Fine");
        assert_eq!(response.reason(), Some("Fine"));
        assert!(!response.is_error());
    }
}
