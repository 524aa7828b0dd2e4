//! `mod_http`: the HTTP/1.x request head parser.
//!
//! A fresh [`HeadParser`] is handed out for every request. It buffers chunks
//! until `httparse` sees a complete head, then fills the request and reports
//! where the head ended in the last chunk.
//!
//! Limits are read from the module's settings, `MaxHeadBytes` (default 8 KiB)
//! and `MaxHeaders` (default 64). Exceeding either is answered with
//! `431 Request Header Fields Too Large`, malformed heads with
//! `400 Bad Request`.

use std::mem::MaybeUninit;
use std::sync::{Arc, Mutex};

use bref_api::environment::Environment;
use bref_api::module::{API_VERSION, LoadContext, Module, ModuleInfo, Version};
use bref_api::pipeline::{ParsingHandler, ParsingHook, PipelineBuilder, Priority};
use bref_api::protocol::{HeaderName, HeaderValue, HttpRequest, HttpResponse, Method, StatusCode, Value};
use bref_api::{Dispose, Owned, owned};
use thiserror::Error;
use tracing::{debug, error, info};

pub const NAME: &str = "mod_http";

const DEFAULT_MAX_HEAD_BYTES: usize = 8 * 1024;
const DEFAULT_MAX_HEADERS: usize = 64;

static INFO: ModuleInfo = ModuleInfo {
    name: NAME,
    description: "HTTP/1.x request parser",
    version: Version::new(0, 3),
    minimum_api_version: API_VERSION,
};

pub fn load(ctx: &LoadContext<'_>) -> Owned<dyn Module> {
    let limits = Limits::from_config(ctx.config);
    ctx.span.in_scope(|| info!(max_head_bytes = limits.max_head_bytes, max_headers = limits.max_headers, "load module {NAME}"));
    owned!(ModHttp::new(limits))
}

/// Bounds on the size of a request head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_head_bytes: usize,
    pub max_headers: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_head_bytes: DEFAULT_MAX_HEAD_BYTES, max_headers: DEFAULT_MAX_HEADERS }
    }
}

impl Limits {
    fn from_config(config: &Value) -> Self {
        let setting = |key: &str, default: usize| {
            config.get(key).as_int().and_then(|n| usize::try_from(n).ok()).filter(|n| *n > 0).unwrap_or(default)
        };
        Self {
            max_head_bytes: setting("MaxHeadBytes", DEFAULT_MAX_HEAD_BYTES),
            max_headers: setting("MaxHeaders", DEFAULT_MAX_HEADERS),
        }
    }
}

#[derive(Debug)]
pub struct ModHttp {
    limits: Limits,
}

impl ModHttp {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }
}

impl Dispose for ModHttp {}

impl Module for ModHttp {
    fn info(&self) -> &ModuleInfo {
        &INFO
    }

    fn register_hooks(&self, pipeline: &mut PipelineBuilder) {
        let limits = self.limits;
        let hook = ParsingHook::new(move |_env: &Environment| {
            ParsingHandler::bind(Arc::new(HeadParser::new(limits)), HeadParser::feed)
        });
        pipeline.parsing_hooks.push(hook, Priority::NORMAL);
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("request head size {current_size} exceeds the limit {max_size}")]
    TooLargeHead { current_size: usize, max_size: usize },

    #[error("header number exceeds the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid request head: {source}")]
    Syntax {
        #[from]
        source: httparse::Error,
    },

    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },
}

impl ParseError {
    pub fn too_large_head(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHead { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    /// The status the client is answered with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::TooLargeHead { .. } | Self::TooManyHeaders { .. } => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            Self::InvalidVersion(_) => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Incremental parser for one request head.
#[derive(Debug)]
pub struct HeadParser {
    limits: Limits,
    buffered: Mutex<Vec<u8>>,
}

impl HeadParser {
    pub fn new(limits: Limits) -> Self {
        Self { limits, buffered: Mutex::new(Vec::new()) }
    }

    /// Feeds one chunk. Returns the end of the head within `chunk` once the
    /// head is complete; sets an error status when it can't be parsed.
    pub fn feed(&self, response: &mut HttpResponse, chunk: &[u8], request: &mut HttpRequest) -> Option<usize> {
        let Ok(mut buffered) = self.buffered.lock() else {
            error!("request parser state poisoned");
            response.set_status(StatusCode::INTERNAL_SERVER_ERROR);
            return None;
        };
        let offset = buffered.len();
        buffered.extend_from_slice(chunk);

        match self.parse(&buffered, request) {
            Ok(Some(head_len)) => {
                buffered.clear();
                Some(head_len.saturating_sub(offset))
            }
            Ok(None) => None,
            Err(e) => {
                debug!(cause = %e, "can't parse request head");
                response.set_status(e.status());
                None
            }
        }
    }

    fn parse(&self, src: &[u8], request: &mut HttpRequest) -> Result<Option<usize>, ParseError> {
        let max_headers = self.limits.max_headers;
        let mut headers = vec![MaybeUninit::<httparse::Header<'_>>::uninit(); max_headers];
        let mut parsed = httparse::Request::new(&mut []);

        let head_len = match parsed.parse_with_uninit_headers(src, &mut headers) {
            Ok(httparse::Status::Complete(head_len)) => head_len,
            Ok(httparse::Status::Partial) => {
                if src.len() > self.limits.max_head_bytes {
                    return Err(ParseError::too_large_head(src.len(), self.limits.max_head_bytes));
                }
                return Ok(None);
            }
            Err(httparse::Error::TooManyHeaders) => return Err(ParseError::too_many_headers(max_headers)),
            Err(e) => return Err(e.into()),
        };
        if head_len > self.limits.max_head_bytes {
            return Err(ParseError::too_large_head(head_len, self.limits.max_head_bytes));
        }

        let method = parsed.method.ok_or(ParseError::InvalidMethod)?;
        request.set_method(Method::from_bytes(method.as_bytes()).map_err(|_| ParseError::InvalidMethod)?);
        request.set_uri(parsed.path.unwrap_or("/"));
        request.set_version(match parsed.version {
            Some(0) => bref_api::protocol::Version::HTTP_10,
            Some(1) => bref_api::protocol::Version::HTTP_11,
            other => return Err(ParseError::InvalidVersion(other)),
        });

        let map = request.headers_mut();
        map.reserve(parsed.headers.len());
        for header in parsed.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(ParseError::invalid_header)?;
            let value = HeaderValue::from_bytes(header.value).map_err(ParseError::invalid_header)?;
            map.append(name, value);
        }
        Ok(Some(head_len))
    }
}
