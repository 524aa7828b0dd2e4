//! The HTTP request model filled in by parsing hooks.
//!
//! A parsing handler receives an empty [`HttpRequest`] and populates it as
//! bytes arrive. Post-parsing hooks may then rewrite it, e.g. changing the URI,
//! before content hooks decide who serves it.

use http::header::{self, AsHeaderName};
use http::{HeaderMap, HeaderValue, Method, Version};

/// An HTTP request head.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    method: Option<Method>,
    uri: String,
    version: Version,
    headers: HeaderMap,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the method, or `None` until a parser sets it.
    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = Some(method);
    }

    /// Returns the raw request target, e.g. `/index.html?a=1`.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn set_uri(&mut self, uri: impl Into<String>) {
        self.uri = uri.into();
    }

    /// Returns the request target without its query string.
    pub fn path(&self) -> &str {
        self.uri.split_once('?').map_or(self.uri.as_str(), |(path, _)| path)
    }

    /// Returns the query string, without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, query)| query)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Returns a header value if it is present and valid visible ASCII.
    pub fn header_str<K: AsHeaderName>(&self, name: K) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Returns the `Host` header without any port suffix.
    pub fn host(&self) -> Option<&str> {
        let host = self.header_str(header::HOST)?;
        // IPv6 literals keep their brackets, only a trailing :port is removed
        let host = match host.rfind(':') {
            Some(i) if !host[i..].contains(']') => &host[..i],
            _ => host,
        };
        Some(host)
    }

    /// Returns whether the client asked to keep the connection open.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent,
    /// HTTP/1.0 requires an explicit `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        let connection = self.headers.get(header::CONNECTION).map(HeaderValue::as_bytes);
        match self.version {
            Version::HTTP_11 => !connection.is_some_and(|v| v.eq_ignore_ascii_case(b"close")),
            Version::HTTP_10 => connection.is_some_and(|v| v.eq_ignore_ascii_case(b"keep-alive")),
            _ => false,
        }
    }
}
