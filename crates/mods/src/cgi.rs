//! `mod_cgi`: serves scripts by running them as CGI processes.
//!
//! Requests whose path ends with the configured extension (`.rb` by default)
//! are mapped below the `DocumentRoot` of their virtual host and executed.
//! The request body is queued for a blocking writer task that feeds the
//! script's standard input, so a script that answers before reading all of
//! its input never stalls the connection. Its standard output is read back
//! through a non-blocking socket registered as the handler's readiness
//! source, so the connection only polls the script when it has written
//! something.
//!
//! ```json
//! {
//!     "DocumentRoot": "/var/www",
//!     "mod_cgi": { "Extension": ".rb", "Interpreter": "ruby" }
//! }
//! ```
//!
//! Without an `Interpreter` the script itself is executed and must be
//! executable. The script answers with a CGI head (`Status`, `Location` and
//! plain headers) followed by the body.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Component, Path};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;

use bref_api::content::{ContentHandler, ReadinessSource};
use bref_api::environment::Environment;
use bref_api::module::{API_VERSION, LoadContext, Module, ModuleInfo, Version};
use bref_api::pipeline::{ContentHook, PipelineBuilder, Priority};
use bref_api::protocol::{HeaderName, HeaderValue, HttpRequest, HttpResponse, StatusCode, Value, header};
use bref_api::{Dispose, Owned, owned};
use bytes::BytesMut;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{Span, debug, error, info, warn};

pub const NAME: &str = "mod_cgi";

const DEFAULT_EXTENSION: &str = ".rb";
const READ_BUFFER_SIZE: usize = 8 * 1024;
const MAX_HEAD_BYTES: usize = 8 * 1024;
const MAX_HEADERS: usize = 32;

static INFO: ModuleInfo = ModuleInfo {
    name: NAME,
    description: "a CGI module able to execute scripts",
    version: Version::new(0, 2),
    minimum_api_version: API_VERSION,
};

pub fn load(ctx: &LoadContext<'_>) -> Owned<dyn Module> {
    let settings = Settings::from_config(ctx.config);
    ctx.span.in_scope(|| info!(extension = settings.extension.as_str(), "load module {NAME}"));
    owned!(ModCgi::new(settings))
}

#[derive(Error, Debug)]
pub enum CgiError {
    #[error("no DocumentRoot configured")]
    NoDocumentRoot,

    #[error("script path leaves the document root: {path}")]
    Traversal { path: String },

    #[error("can't start {script}: {source}")]
    Spawn { script: String, source: io::Error },

    #[error("invalid script response head: {reason}")]
    InvalidHead { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl CgiError {
    pub fn invalid_head<S: ToString>(str: S) -> Self {
        Self::InvalidHead { reason: str.to_string() }
    }

    /// The status the client is answered with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Traversal { .. } => StatusCode::FORBIDDEN,
            Self::InvalidHead { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<httparse::Error> for CgiError {
    fn from(e: httparse::Error) -> Self {
        Self::invalid_head(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub extension: String,
    pub interpreter: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self { extension: DEFAULT_EXTENSION.to_owned(), interpreter: None }
    }
}

impl Settings {
    fn from_config(config: &Value) -> Self {
        Self {
            extension: config.get("Extension").as_str().unwrap_or(DEFAULT_EXTENSION).to_owned(),
            interpreter: config.get("Interpreter").as_str().map(str::to_owned),
        }
    }

    fn generate(
        &self,
        env: &Environment,
        request: &HttpRequest,
        response: &mut HttpResponse,
        source: &mut ReadinessSource,
    ) -> Option<Owned<dyn ContentHandler>> {
        if !request.path().ends_with(self.extension.as_str()) {
            return None;
        }
        match self.start(env, request) {
            Ok((process, readiness)) => {
                *source = readiness;
                Some(owned!(process))
            }
            Err(e) => {
                env.span().in_scope(|| error!(cause = %e, uri = request.uri(), "[{NAME}] can't run script"));
                response.set_status(e.status());
                None
            }
        }
    }

    fn start(&self, env: &Environment, request: &HttpRequest) -> Result<(CgiProcess, ReadinessSource), CgiError> {
        let root = env.conf().find_value_for("DocumentRoot", request).as_str().ok_or(CgiError::NoDocumentRoot)?;
        let path = request.path();
        let relative = Path::new(path.trim_start_matches('/'));
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(CgiError::Traversal { path: path.to_owned() });
        }
        let script = Path::new(root).join(relative);

        let runtime = Handle::try_current().map_err(io::Error::other)?;
        let (stdout, script_stdout) = UnixStream::pair()?;
        stdout.set_nonblocking(true)?;
        let readiness = ReadinessSource::from_fd(&stdout)?;

        let mut command = match &self.interpreter {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(&script);
                command
            }
            None => Command::new(&script),
        };
        if let Some(dir) = script.parent() {
            command.current_dir(dir);
        }
        command
            .envs(meta_variables(env, request, &script))
            .stdin(Stdio::piped())
            .stdout(Stdio::from(OwnedFd::from(script_stdout)))
            .stderr(Stdio::inherit());

        let mut child =
            command.spawn().map_err(|source| CgiError::Spawn { script: script.display().to_string(), source })?;
        debug!(pid = child.id(), script = %script.display(), "script started");
        let input = child.stdin.take().map(|stdin| feed(&runtime, stdin));
        Ok((CgiProcess { child, input, stdout, head: Some(Vec::new()) }, readiness))
    }
}

/// Starts a blocking task writing queued chunks to the script's input. The
/// input is closed once the returned sender is dropped.
fn feed(runtime: &Handle, mut stdin: ChildStdin) -> UnboundedSender<Vec<u8>> {
    let (sender, mut receiver) = mpsc::unbounded_channel::<Vec<u8>>();
    let span = Span::current();
    runtime.spawn_blocking(move || {
        let _entered = span.enter();
        while let Some(chunk) = receiver.blocking_recv() {
            if let Err(e) = stdin.write_all(&chunk) {
                debug!(cause = %e, "script stopped reading its input");
                return;
            }
        }
    });
    sender
}

/// The CGI/1.1 meta-variables for a request.
fn meta_variables(env: &Environment, request: &HttpRequest, script: &Path) -> Vec<(String, String)> {
    let mut vars = vec![
        ("GATEWAY_INTERFACE".to_owned(), "CGI/1.1".to_owned()),
        ("SERVER_SOFTWARE".to_owned(), format!("bref/{}", env!("CARGO_PKG_VERSION"))),
        ("SERVER_PROTOCOL".to_owned(), format!("{:?}", request.version())),
        ("REQUEST_METHOD".to_owned(), request.method().map_or("GET", |m| m.as_str()).to_owned()),
        ("SCRIPT_NAME".to_owned(), request.path().to_owned()),
        ("SCRIPT_FILENAME".to_owned(), script.display().to_string()),
        ("QUERY_STRING".to_owned(), request.query().unwrap_or_default().to_owned()),
        ("REMOTE_ADDR".to_owned(), env.client().addr.ip().to_string()),
        ("REMOTE_PORT".to_owned(), env.client().addr.port().to_string()),
    ];
    for (name, value) in request.headers() {
        let Ok(value) = value.to_str() else {
            continue;
        };
        let key = if name == header::CONTENT_LENGTH {
            "CONTENT_LENGTH".to_owned()
        } else if name == header::CONTENT_TYPE {
            "CONTENT_TYPE".to_owned()
        } else {
            format!("HTTP_{}", name.as_str().to_ascii_uppercase().replace('-', "_"))
        };
        vars.push((key, value.to_owned()));
    }
    vars
}

#[derive(Debug)]
pub struct ModCgi {
    settings: Arc<Settings>,
}

impl ModCgi {
    pub fn new(settings: Settings) -> Self {
        Self { settings: Arc::new(settings) }
    }
}

impl Dispose for ModCgi {}

impl Module for ModCgi {
    fn info(&self) -> &ModuleInfo {
        &INFO
    }

    fn register_hooks(&self, pipeline: &mut PipelineBuilder) {
        let settings = Arc::clone(&self.settings);
        let hook = ContentHook::new(move |env, request, response, source| settings.generate(env, request, response, source));
        // dynamic content goes before modules that would serve the script as a file
        pipeline.content_hooks.push(hook, Priority::HIGH);
    }
}

/// A running script.
#[derive(Debug)]
struct CgiProcess {
    child: Child,
    input: Option<UnboundedSender<Vec<u8>>>,
    stdout: UnixStream,
    // the response head while it is still being read
    head: Option<Vec<u8>>,
}

impl CgiProcess {
    fn forward(&mut self, response: &mut HttpResponse, data: &[u8], output: &mut BytesMut) -> Result<(), CgiError> {
        let Some(mut head) = self.head.take() else {
            output.extend_from_slice(data);
            return Ok(());
        };
        head.extend_from_slice(data);
        match parse_head(&head, response)? {
            Some(body_start) => output.extend_from_slice(&head[body_start..]),
            None if head.len() > MAX_HEAD_BYTES => {
                return Err(CgiError::invalid_head(format!("head exceeds {MAX_HEAD_BYTES} bytes")));
            }
            None => self.head = Some(head),
        }
        Ok(())
    }
}

impl Dispose for CgiProcess {
    fn dispose(self: Box<Self>) {
        let mut this = *self;
        drop(this.input.take());
        match this.child.try_wait() {
            Ok(Some(status)) => debug!(%status, "script exited"),
            Ok(None) => {
                debug!(pid = this.child.id(), "stopping script");
                if let Err(e) = this.child.kill() {
                    warn!(cause = %e, "can't stop script");
                }
                if let Err(e) = this.child.wait() {
                    warn!(cause = %e, "can't reap script");
                }
            }
            Err(e) => warn!(cause = %e, "can't query script status"),
        }
    }
}

impl ContentHandler for CgiProcess {
    fn in_content(&mut self, _response: &mut HttpResponse, chunk: &[u8]) -> bool {
        if chunk.is_empty() {
            // the writer closes stdin once the queue is dropped and drained
            self.input = None;
            return true;
        }
        let Some(input) = self.input.as_ref() else {
            return true;
        };
        if input.send(chunk.to_vec()).is_err() {
            debug!("script input already closed");
            self.input = None;
            return true;
        }
        false
    }

    fn out_content(&mut self, response: &mut HttpResponse, output: &mut BytesMut) -> bool {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        // drain everything available, readiness is only signalled again for new data
        loop {
            match self.stdout.read(&mut buf) {
                Ok(0) => {
                    if self.head.is_some() {
                        error!("script ended before its response head");
                        response.set_status(StatusCode::BAD_GATEWAY);
                    }
                    return true;
                }
                Ok(n) => {
                    if let Err(e) = self.forward(response, &buf[..n], output) {
                        error!(cause = %e, "can't forward script output");
                        response.set_status(e.status());
                        return true;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(cause = %e, "can't read script output");
                    if response.status().is_none() {
                        response.set_status(StatusCode::INTERNAL_SERVER_ERROR);
                    }
                    return true;
                }
            }
        }
    }
}

/// Parses a CGI response head into `response`. Returns where the body
/// starts, or `None` when the head is incomplete.
fn parse_head(src: &[u8], response: &mut HttpResponse) -> Result<Option<usize>, CgiError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let (body_start, headers) = match httparse::parse_headers(src, &mut headers)? {
        httparse::Status::Complete(parsed) => parsed,
        httparse::Status::Partial => return Ok(None),
    };

    let mut status = None;
    for field in headers {
        if field.name.eq_ignore_ascii_case("Status") {
            status = Some(parse_status(field.value)?);
            continue;
        }
        let name = HeaderName::from_bytes(field.name.as_bytes()).map_err(CgiError::invalid_head)?;
        let value = HeaderValue::from_bytes(field.value).map_err(CgiError::invalid_head)?;
        response.headers_mut().append(name, value);
    }

    match status {
        Some((code, Some(reason))) => response.set_status_line(code, reason),
        Some((code, None)) => response.set_status(code),
        None if response.headers().contains_key(header::LOCATION) => response.set_status(StatusCode::FOUND),
        None => response.set_status(StatusCode::OK),
    }
    Ok(Some(body_start))
}

/// Parses a `Status` header value such as `404 Not Found`.
fn parse_status(value: &[u8]) -> Result<(StatusCode, Option<String>), CgiError> {
    let value = std::str::from_utf8(value).map_err(CgiError::invalid_head)?.trim();
    let (code, reason) = match value.split_once(' ') {
        Some((code, reason)) => (code, Some(reason.trim().to_owned())),
        None => (value, None),
    };
    let code = StatusCode::from_bytes(code.as_bytes()).map_err(CgiError::invalid_head)?;
    Ok((code, reason.filter(|r| !r.is_empty())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bref_api::config::ServerConfig;
    use bref_api::environment::Client;

    fn env(config: &str) -> Environment {
        let conf = ServerConfig::from_json(config).unwrap();
        Environment::new(Arc::new(conf), Span::none(), Client::new(3, ([192, 168, 0, 9], 5000).into()))
    }

    fn request(uri: &str) -> HttpRequest {
        let mut request = HttpRequest::new();
        request.set_uri(uri);
        request
    }

    #[test]
    fn test_parse_head() {
        let mut response = HttpResponse::new();
        let src = b"Status: 404 Not Here\r\nContent-Type: text/plain\r\n\r\nmissing";
        assert_eq!(parse_head(src, &mut response).unwrap(), Some(src.len() - 7));
        assert_eq!(response.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(response.reason(), Some("Not Here"));
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    }

    #[test]
    fn test_parse_head_defaults() {
        let mut response = HttpResponse::new();
        assert_eq!(parse_head(b"Content-Type: text/html\n", &mut response).unwrap(), None);
        assert_eq!(parse_head(b"Content-Type: text/html\n\n", &mut response).unwrap(), Some(25));
        assert_eq!(response.status(), Some(StatusCode::OK));

        let mut response = HttpResponse::new();
        parse_head(b"Location: /elsewhere\r\n\r\n", &mut response).unwrap();
        assert_eq!(response.status(), Some(StatusCode::FOUND));
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status(b"200").unwrap(), (StatusCode::OK, None));
        assert_eq!(parse_status(b" 503 Busy ").unwrap(), (StatusCode::SERVICE_UNAVAILABLE, Some("Busy".to_owned())));
        assert!(matches!(parse_status(b"abc"), Err(CgiError::InvalidHead { .. })));
    }

    #[test]
    fn test_other_extensions_are_declined() {
        let settings = Settings::default();
        let mut response = HttpResponse::new();
        let mut source = ReadinessSource::None;
        let handler = settings.generate(&env("{}"), &request("/index.php"), &mut response, &mut source);
        assert!(handler.is_none());
        assert_eq!(response.status(), None);
        assert!(source.is_none());
    }

    #[test]
    fn test_missing_document_root_is_500() {
        let settings = Settings::default();
        let mut response = HttpResponse::new();
        let mut source = ReadinessSource::None;
        let handler = settings.generate(&env("{}"), &request("/app.rb"), &mut response, &mut source);
        assert!(handler.is_none());
        assert_eq!(response.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn test_traversal_is_403() {
        let settings = Settings::default();
        let mut response = HttpResponse::new();
        let mut source = ReadinessSource::None;
        let env = env(r#"{ "DocumentRoot": "/var/www" }"#);
        let handler = settings.generate(&env, &request("/../etc/passwd.rb"), &mut response, &mut source);
        assert!(handler.is_none());
        assert_eq!(response.status(), Some(StatusCode::FORBIDDEN));
    }

    #[test]
    fn test_meta_variables() {
        let mut request = request("/bin/app.rb?name=bref");
        request.headers_mut().insert(header::CONTENT_LENGTH, HeaderValue::from_static("4"));
        request.headers_mut().insert("x-trace-id", HeaderValue::from_static("abc"));
        let vars = meta_variables(&env("{}"), &request, Path::new("/var/www/bin/app.rb"));
        let get = |key: &str| vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());

        assert_eq!(get("QUERY_STRING"), Some("name=bref"));
        assert_eq!(get("SCRIPT_NAME"), Some("/bin/app.rb"));
        assert_eq!(get("SCRIPT_FILENAME"), Some("/var/www/bin/app.rb"));
        assert_eq!(get("CONTENT_LENGTH"), Some("4"));
        assert_eq!(get("HTTP_X_TRACE_ID"), Some("abc"));
        assert_eq!(get("REMOTE_ADDR"), Some("192.168.0.9"));
        assert_eq!(get("SERVER_PROTOCOL"), Some("HTTP/1.1"));
    }

    #[test]
    fn test_settings_from_config() {
        let config = Value::from_json(r#"{ "Extension": ".cgi", "Interpreter": "sh" }"#).unwrap();
        assert_eq!(
            Settings::from_config(&config),
            Settings { extension: ".cgi".to_owned(), interpreter: Some("sh".to_owned()) }
        );
        assert_eq!(Settings::from_config(&Value::Null), Settings::default());
    }
}
