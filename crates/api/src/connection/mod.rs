//! Connection handling.
//!
//! [`HttpConnection`] is the host side of the pipeline: it owns a client
//! connection and walks every request on it through the stages of a frozen
//! [`Pipeline`](crate::pipeline::Pipeline).
//!
//! # Features
//!
//! - Keep-alive for HTTP/1.1, and for HTTP/1.0 on request
//! - Expect-continue for requests carrying a body
//! - `HEAD` responses carry the length of the body they omit
//! - Bodies still being produced after the first pull are streamed with
//!   chunked transfer encoding to HTTP/1.1 clients
//! - Error statuses answered without a body when no handler claims them

mod chunked_encoder;
mod error;
mod head_encoder;
mod http_connection;

pub use chunked_encoder::{BodyItem, ChunkedEncoder};
pub use error::ConnectionError;
pub use head_encoder::{BodySize, HeadEncoder};
pub use http_connection::HttpConnection;
