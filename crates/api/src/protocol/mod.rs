//! Protocol data shared by hooks: requests, responses and configuration values.
//!
//! Method, version, status and header types come from the `http` crate. The
//! request keeps its target as a raw string because rewrite hooks edit it
//! textually.

mod request;
pub use request::HttpRequest;

mod response;
pub use response::HttpResponse;

mod value;
pub use value::NULL;
pub use value::Value;

pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version, header};
