#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bref_api::config::ServerConfig;
use bref_api::connection::HttpConnection;
use bref_api::content::ContentHandler;
use bref_api::environment::{Client, Environment};
use bref_api::module::{Module, ModuleInfo, Version};
use bref_api::pipeline::{ContentHook, ParsingHandler, ParsingHook, Pipeline, PipelineBuilder, Priority};
use bref_api::protocol::{HeaderName, HeaderValue, HttpResponse, Method, StatusCode};
use bref_api::{Dispose, owned};
use bytes::BytesMut;
use tokio::io::AsyncRead;
use tracing::Span;

pub fn env() -> Environment {
    Environment::new(
        Arc::new(ServerConfig::default()),
        Span::none(),
        Client::new(1, "127.0.0.1:40000".parse().unwrap()),
    )
}

/// A deliberately small parser: buffers until the blank line, then reads the
/// request line and `name: value` headers.
pub fn line_parser() -> ParsingHook {
    ParsingHook::new(|_env| {
        let buffered = Arc::new(Mutex::new(Vec::<u8>::new()));
        ParsingHandler::new(move |response, chunk, request| {
            let mut buffered = buffered.lock().unwrap();
            let offset = buffered.len();
            buffered.extend_from_slice(chunk);
            let end = buffered.windows(4).position(|w| w == b"\r\n\r\n")? + 4;

            let head = String::from_utf8_lossy(&buffered[..end]).into_owned();
            let mut lines = head.split("\r\n");
            let mut parts = lines.next().unwrap_or_default().split(' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(method), Some(uri), Some(version)) => {
                    request.set_method(Method::from_bytes(method.as_bytes()).unwrap());
                    request.set_uri(uri);
                    if version == "HTTP/1.0" {
                        request.set_version(bref_api::protocol::Version::HTTP_10);
                    }
                }
                _ => {
                    response.set_status(StatusCode::BAD_REQUEST);
                    return None;
                }
            }
            for line in lines.filter(|l| !l.is_empty()) {
                if let Some((name, value)) = line.split_once(':') {
                    request.headers_mut().append(
                        HeaderName::from_bytes(name.trim().as_bytes()).unwrap(),
                        HeaderValue::from_str(value.trim()).unwrap(),
                    );
                }
            }
            Some(end - offset)
        })
    })
}

/// Replies with a fixed body, setting `200 OK` on first output.
pub struct Fixed(pub &'static str);

impl Dispose for Fixed {}

impl ContentHandler for Fixed {
    fn in_content(&mut self, _response: &mut HttpResponse, _chunk: &[u8]) -> bool {
        false
    }

    fn out_content(&mut self, response: &mut HttpResponse, output: &mut BytesMut) -> bool {
        response.set_status(StatusCode::OK);
        output.extend_from_slice(self.0.as_bytes());
        true
    }
}

pub fn fixed(body: &'static str) -> ContentHook {
    ContentHook::new(move |_, _, _, _| Some(owned!(Fixed(body))))
}

/// Replies with the request body it received.
#[derive(Default)]
pub struct Echo {
    pub body: Vec<u8>,
}

impl Dispose for Echo {}

impl ContentHandler for Echo {
    fn in_content(&mut self, _response: &mut HttpResponse, chunk: &[u8]) -> bool {
        self.body.extend_from_slice(chunk);
        false
    }

    fn out_content(&mut self, response: &mut HttpResponse, output: &mut BytesMut) -> bool {
        response.set_status(StatusCode::OK);
        output.extend_from_slice(&self.body);
        true
    }
}

/// A module with a content hook, recording whether it was disposed.
pub struct TestModule {
    pub info: ModuleInfo,
    pub disposed: Arc<AtomicBool>,
}

impl TestModule {
    pub fn new(name: &'static str, minimum_api_version: Version) -> Self {
        let info = ModuleInfo { name, description: "test module", version: Version::new(1, 0), minimum_api_version };
        Self { info, disposed: Arc::new(AtomicBool::new(false)) }
    }
}

impl Dispose for TestModule {
    fn dispose(self: Box<Self>) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

impl Module for TestModule {
    fn info(&self) -> &ModuleInfo {
        &self.info
    }

    fn register_hooks(&self, pipeline: &mut PipelineBuilder) {
        pipeline.content_hooks.push(fixed("from module"), Priority::NORMAL);
    }
}

/// Counts how often a hook was asked.
pub fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

pub async fn serve(pipeline: Pipeline, input: &[u8]) -> String {
    serve_reader(pipeline, input).await
}

/// Routes connection logs to the test output, shown for failing tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_max_level(tracing::Level::TRACE).with_test_writer().try_init();
}

pub async fn serve_reader<R: AsyncRead + Unpin>(pipeline: Pipeline, reader: R) -> String {
    init_tracing();
    let mut output = Vec::new();
    let connection = HttpConnection::new(reader, &mut output, Arc::new(pipeline), env());
    connection.process().await.unwrap();
    String::from_utf8(output).unwrap()
}

pub fn builder_with_parser() -> PipelineBuilder {
    let mut builder = PipelineBuilder::new();
    builder.parsing_hooks.push(line_parser(), Priority::NORMAL);
    builder
}
