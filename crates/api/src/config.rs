//! Configuration lookup offered to modules.
//!
//! Modules read settings through [`ConfHelper`] instead of walking the value
//! tree themselves. The request-aware lookup lets a virtual host override a
//! server-wide key: with a configuration like
//!
//! ```json
//! {
//!     "DocumentRoot": "/var/www",
//!     "VirtualHosts": {
//!         "example.com": { "DocumentRoot": "/srv/example" }
//!     }
//! }
//! ```
//!
//! a request with `Host: example.com:8080` resolves `DocumentRoot` to
//! `/srv/example`, every other request to `/var/www`.

use crate::protocol::{HttpRequest, Value};

/// Key of the map holding per-host overrides.
pub const VIRTUAL_HOSTS: &str = "VirtualHosts";

/// Read-only configuration lookup.
pub trait ConfHelper: Send + Sync {
    /// The whole configuration tree.
    fn root(&self) -> &Value;

    /// Looks up a server-wide key. Misses yield [`Value::Null`].
    fn find_value(&self, key: &str) -> &Value {
        self.root().get(key)
    }

    /// Looks up a key in the context of a request, preferring the matching
    /// virtual host's value over the server-wide one.
    fn find_value_for(&self, key: &str, request: &HttpRequest) -> &Value;
}

/// [`ConfHelper`] over a [`Value`] tree with `VirtualHosts` support.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    root: Value,
}

impl ServerConfig {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    /// Parses a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error when `json` is malformed.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Value::from_json(json).map(Self::new)
    }

    fn virtual_host(&self, host: &str) -> Option<&Value> {
        self.root
            .get(VIRTUAL_HOSTS)
            .as_map()?
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(host))
            .map(|(_, vhost)| vhost)
    }
}

impl ConfHelper for ServerConfig {
    fn root(&self) -> &Value {
        &self.root
    }

    fn find_value_for(&self, key: &str, request: &HttpRequest) -> &Value {
        let vhost_value = request.host().and_then(|host| self.virtual_host(host)).map(|vhost| vhost.get(key));
        match vhost_value {
            Some(value) if !value.is_null() => value,
            _ => self.find_value(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use http::header::HOST;
    use indoc::indoc;

    fn config() -> ServerConfig {
        ServerConfig::from_json(indoc! {r#"
        {
            "DocumentRoot": "/var/www",
            "Index": "index.html",
            "VirtualHosts": {
                "Example.com": { "DocumentRoot": "/srv/example" }
            }
        }
        "#})
        .unwrap()
    }

    fn request_for(host: &'static str) -> HttpRequest {
        let mut request = HttpRequest::new();
        request.headers_mut().insert(HOST, HeaderValue::from_static(host));
        request
    }

    #[test]
    fn test_find_value() {
        let config = config();
        assert_eq!(config.find_value("DocumentRoot").as_str(), Some("/var/www"));
        assert!(config.find_value("Missing").is_null());
    }

    #[test]
    fn test_virtual_host_overrides() {
        let config = config();
        let request = request_for("example.com:8080");
        assert_eq!(config.find_value_for("DocumentRoot", &request).as_str(), Some("/srv/example"));
        // keys the virtual host does not define fall back to the server-wide value
        assert_eq!(config.find_value_for("Index", &request).as_str(), Some("index.html"));
    }

    #[test]
    fn test_unknown_host_falls_back() {
        let config = config();
        let request = request_for("other.org");
        assert_eq!(config.find_value_for("DocumentRoot", &request).as_str(), Some("/var/www"));
        assert_eq!(config.find_value_for("DocumentRoot", &HttpRequest::new()).as_str(), Some("/var/www"));
    }
}
