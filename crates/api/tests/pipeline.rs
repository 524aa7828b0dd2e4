mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bref_api::content::{ContentState, ReadinessSource};
use bref_api::environment::Environment;
use bref_api::module::{LoadError, Module, ModuleInfo, Session, Version};
use bref_api::pipeline::{
    ConnectionHandler, ConnectionHook, ContentHook, OnReceiveHandler, OnReceiveHook, ParsingHandler, ParsingHook,
    PipelineBuilder, PipelineError, PostParsingHook, Priority, Stage, TransformHandler, TransformHook,
};
use bref_api::protocol::{HttpRequest, HttpResponse, StatusCode};
use bref_api::{Dispose, Owned, owned};
use bytes::BytesMut;

use common::{Fixed, TestModule, count, counter, env};

fn counted_content(calls: &Arc<AtomicUsize>, answer: Option<&'static str>) -> ContentHook {
    let calls = Arc::clone(calls);
    ContentHook::new(move |_, _, _, _| {
        calls.fetch_add(1, Ordering::SeqCst);
        match answer {
            Some(body) => Some(owned!(Fixed(body))),
            None => None,
        }
    })
}

#[test]
fn test_first_content_hook_wins() {
    let (high, normal, low) = (counter(), counter(), counter());
    let mut builder = PipelineBuilder::new();
    // registered out of priority order on purpose
    builder.content_hooks.push(counted_content(&low, Some("low")), 0.2_f32);
    builder.content_hooks.push(counted_content(&high, Some("high")), Priority::HIGH);
    builder.content_hooks.push(counted_content(&normal, Some("normal")), Priority::NORMAL);
    let pipeline = builder.freeze().unwrap();

    let env = env();
    let mut response = HttpResponse::new();
    let stream = pipeline.select_content(&env, &HttpRequest::new(), &mut response).unwrap();

    let stream = stream.expect("a content handler");
    assert_eq!(stream.state(), ContentState::Created);
    assert_eq!((count(&high), count(&normal), count(&low)), (1, 0, 0));
}

#[test]
fn test_declining_hooks_pass_to_the_next() {
    let (high, normal, low) = (counter(), counter(), counter());
    let mut builder = PipelineBuilder::new();
    builder.content_hooks.push(counted_content(&high, None), Priority::HIGH);
    builder.content_hooks.push(counted_content(&normal, None), Priority::NORMAL);
    builder.content_hooks.push(counted_content(&low, Some("low")), Priority::LOW);
    let pipeline = builder.freeze().unwrap();

    let mut response = HttpResponse::new();
    let stream = pipeline.select_content(&env(), &HttpRequest::new(), &mut response).unwrap();
    assert!(stream.is_some());
    assert_eq!((count(&high), count(&normal), count(&low)), (1, 1, 1));
}

#[test]
fn test_declining_with_error_status_stops_selection() {
    let low = counter();
    let mut builder = PipelineBuilder::new();
    builder.content_hooks.push(
        ContentHook::new(|_, _, response: &mut HttpResponse, _| {
            response.set_status(StatusCode::INTERNAL_SERVER_ERROR);
            None
        }),
        Priority::HIGH,
    );
    builder.content_hooks.push(counted_content(&low, Some("low")), Priority::LOW);
    let pipeline = builder.freeze().unwrap();

    let mut response = HttpResponse::new();
    let stream = pipeline.select_content(&env(), &HttpRequest::new(), &mut response).unwrap();
    assert!(stream.is_none());
    assert_eq!(response.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    assert_eq!(count(&low), 0);
}

#[test]
fn test_readiness_source_is_kept() {
    let mut builder = PipelineBuilder::new();
    builder.content_hooks.push(
        ContentHook::new(|_, _, _, source: &mut ReadinessSource| {
            *source = ReadinessSource::None;
            Some(owned!(Fixed("x")))
        }),
        Priority::NORMAL,
    );
    let pipeline = builder.freeze().unwrap();
    let stream = pipeline.select_content(&env(), &HttpRequest::new(), &mut HttpResponse::new()).unwrap().unwrap();
    assert!(stream.source().is_none());
}

#[test]
fn test_parser_selection_skips_empty_answers() {
    let mut builder = PipelineBuilder::new();
    builder.parsing_hooks.push(ParsingHook::new(|_| ParsingHandler::empty()), Priority::HIGH);
    builder.parsing_hooks.push(ParsingHook::new(|_| ParsingHandler::new(|_, chunk: &[u8], _| Some(chunk.len()))), Priority::LOW);
    let pipeline = builder.freeze().unwrap();

    let parser = pipeline.select_parser(&env()).unwrap().expect("a parser");
    let mut request = HttpRequest::new();
    assert_eq!(parser.call((&mut HttpResponse::new(), b"abc".as_slice(), &mut request)), Ok(Some(3)));

    let empty = PipelineBuilder::new().freeze().unwrap();
    assert!(empty.select_parser(&env()).unwrap().is_none());
}

#[test]
fn test_connection_gate_stops_at_first_refusal() {
    let later = counter();
    let seen = Arc::clone(&later);
    let mut builder = PipelineBuilder::new();
    builder.connection_hooks.push(ConnectionHook::new(|_| ConnectionHandler::empty()), Priority::HIGH);
    builder.connection_hooks.push(
        ConnectionHook::new(|_| {
            ConnectionHandler::new(|response: &mut HttpResponse, _env: &Environment| {
                response.set_status(StatusCode::FORBIDDEN);
                false
            })
        }),
        Priority::NORMAL,
    );
    builder.connection_hooks.push(
        ConnectionHook::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            ConnectionHandler::new(|_: &mut HttpResponse, _: &Environment| true)
        }),
        Priority::LOW,
    );
    let pipeline = builder.freeze().unwrap();

    let mut response = HttpResponse::new();
    assert!(!pipeline.accept_connection(&mut response, &env()).unwrap());
    assert_eq!(response.status(), Some(StatusCode::FORBIDDEN));
    assert_eq!(count(&later), 0);
}

#[test]
fn test_on_receive_gate_may_edit_buffer() {
    let mut builder = PipelineBuilder::new();
    builder.on_receive_hooks.push(
        OnReceiveHook::new(|_| {
            OnReceiveHandler::new(|_, buffer: &mut BytesMut| {
                buffer.make_ascii_lowercase();
                true
            })
        }),
        Priority::NORMAL,
    );
    let pipeline = builder.freeze().unwrap();

    let mut buffer = BytesMut::from(&b"ABC"[..]);
    assert!(pipeline.accept_received(&env(), &mut buffer).unwrap());
    assert_eq!(&buffer[..], b"abc");
}

#[test]
fn test_post_parsing_hooks_rewrite_in_priority_order() {
    let mut builder = PipelineBuilder::new();
    builder.post_parsing_hooks.push(
        PostParsingHook::new(|_, request: &mut HttpRequest, _| {
            let uri = format!("{}-low", request.uri());
            request.set_uri(uri);
            TransformHandler::empty()
        }),
        Priority::LOW,
    );
    builder.post_parsing_hooks.push(
        PostParsingHook::new(|_, request: &mut HttpRequest, _| {
            let uri = format!("{}-high", request.uri());
            request.set_uri(uri);
            TransformHandler::empty()
        }),
        Priority::HIGH,
    );
    let pipeline = builder.freeze().unwrap();

    let mut request = HttpRequest::new();
    request.set_uri("/a");
    let chain = pipeline.post_parsing_chain(&env(), &mut request, &mut HttpResponse::new()).unwrap();
    assert_eq!(request.uri(), "/a-high-low");
    assert!(chain.is_empty());
}

#[test]
fn test_downstream_chain_composes_by_priority() {
    let append = |tag: &'static str| {
        TransformHook::new(move |_, _, _| {
            TransformHandler::new(move |_, input: &[u8], output: &mut BytesMut| {
                if !input.is_empty() {
                    output.extend_from_slice(input);
                    output.extend_from_slice(tag.as_bytes());
                }
            })
        })
    };
    let mut builder = PipelineBuilder::new();
    builder.transform_hooks.push(append("b"), Priority::LOW);
    builder.transform_hooks.push(append("a"), Priority::HIGH);
    builder.transform_hooks.push(TransformHook::new(|_, _, _| TransformHandler::empty()), Priority::NORMAL);
    let pipeline = builder.freeze().unwrap();

    let mut response = HttpResponse::new();
    let downstream = pipeline.downstream(&env(), &HttpRequest::new(), &mut response).unwrap();
    assert_eq!(&downstream.process(&mut response, b"x").unwrap()[..], b"xab");
}

#[test]
fn test_empty_hook_is_rejected_at_freeze() {
    let mut builder = PipelineBuilder::new();
    builder.content_hooks.push(ContentHook::empty(), Priority::NORMAL);
    assert_eq!(builder.freeze().unwrap_err(), PipelineError::EmptyHook { stage: Stage::Content, index: 0 });
}

#[test]
fn test_minor_mismatch_loads() {
    let mut builder = PipelineBuilder::with_api_version(Version::new(1, 2));
    let module = TestModule::new("old_minor", Version::new(1, 0));
    let disposed = Arc::clone(&module.disposed);

    builder.load_module(owned!(module)).unwrap();
    assert_eq!(builder.stage_len(Stage::Content), 1);

    let pipeline = builder.freeze().unwrap();
    assert_eq!(pipeline.module_names().collect::<Vec<_>>(), vec!["old_minor"]);
    assert!(!disposed.load(Ordering::SeqCst));
    drop(pipeline);
    assert!(disposed.load(Ordering::SeqCst));
}

#[test]
fn test_major_mismatch_is_rejected() {
    let mut builder = PipelineBuilder::with_api_version(Version::new(1, 2));
    let module = TestModule::new("too_new", Version::new(2, 0));
    let disposed = Arc::clone(&module.disposed);

    let err = builder.load_module(owned!(module)).unwrap_err();
    assert_eq!(
        err,
        LoadError::IncompatibleVersion { name: "too_new", required: Version::new(2, 0), provided: Version::new(1, 2) }
    );
    assert_eq!(builder.hook_count(), 0);
    assert!(disposed.load(Ordering::SeqCst));
}

#[test]
fn test_duplicate_module_is_rejected() {
    let mut builder = PipelineBuilder::with_api_version(Version::new(1, 0));
    builder.load_module(owned!(TestModule::new("twice", Version::new(1, 0)))).unwrap();
    let err = builder.load_module(owned!(TestModule::new("twice", Version::new(1, 0)))).unwrap_err();
    assert_eq!(err, LoadError::Duplicate { name: "twice" });
    assert_eq!(builder.hook_count(), 1);
}

struct Counting {
    requests: Arc<AtomicUsize>,
}

impl Dispose for Counting {}

impl Session for Counting {
    fn on_request(&mut self, _request: &HttpRequest, _response: &mut HttpResponse) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

struct SessionModule {
    info: ModuleInfo,
    requests: Arc<AtomicUsize>,
}

impl Dispose for SessionModule {}

impl Module for SessionModule {
    fn info(&self) -> &ModuleInfo {
        &self.info
    }

    fn register_hooks(&self, _pipeline: &mut PipelineBuilder) {}

    fn open_session(&self, _env: &Environment) -> Option<Owned<dyn Session>> {
        Some(owned!(Counting { requests: Arc::clone(&self.requests) }))
    }
}

#[test]
fn test_sessions_open_per_connection() {
    let requests = counter();
    let module = SessionModule {
        info: ModuleInfo {
            name: "sessions",
            description: "",
            version: Version::new(0, 1),
            minimum_api_version: bref_api::module::API_VERSION,
        },
        requests: Arc::clone(&requests),
    };
    let mut builder = PipelineBuilder::new();
    builder.load_module(owned!(module)).unwrap();
    let pipeline = builder.freeze().unwrap();

    let mut sessions = pipeline.open_sessions(&env());
    assert_eq!(sessions.len(), 1);
    sessions[0].on_request(&HttpRequest::new(), &mut HttpResponse::new());
    assert_eq!(count(&requests), 1);
}
