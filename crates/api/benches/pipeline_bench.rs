use std::hint::black_box;
use std::sync::Arc;

use bref_api::config::ServerConfig;
use bref_api::connection::{BodySize, HeadEncoder, HttpConnection};
use bref_api::content::ContentHandler;
use bref_api::environment::{Client, Environment};
use bref_api::pipeline::{
    ContentHook, ParsingHandler, ParsingHook, Pipeline, PipelineBuilder, Priority, TransformHandler, TransformHook,
};
use bref_api::protocol::{HttpRequest, HttpResponse, StatusCode};
use bref_api::{Dispose, owned};
use bytes::BytesMut;
use criterion::{Criterion, criterion_group, criterion_main};
use tokio_util::codec::Encoder;
use tracing::Span;

struct Hello;

impl Dispose for Hello {}

impl ContentHandler for Hello {
    fn in_content(&mut self, _response: &mut HttpResponse, _chunk: &[u8]) -> bool {
        true
    }

    fn out_content(&mut self, response: &mut HttpResponse, output: &mut BytesMut) -> bool {
        response.set_status(StatusCode::OK);
        output.extend_from_slice(b"Hello World!");
        true
    }
}

fn env() -> Environment {
    Environment::new(Arc::new(ServerConfig::default()), Span::none(), Client::new(0, ([127, 0, 0, 1], 8080).into()))
}

/// Nine declining content hooks in front of the one that answers.
fn pipeline() -> Pipeline {
    let mut builder = PipelineBuilder::new();
    for i in 0..9u8 {
        builder.content_hooks.push(ContentHook::new(|_, _, _, _| None), Priority(1.0 - f32::from(i) * 0.1));
    }
    builder.content_hooks.push(ContentHook::new(|_, _, _, _| Some(owned!(Hello))), Priority::LOW);
    builder.parsing_hooks.push(
        ParsingHook::new(|_| {
            ParsingHandler::new(|_, chunk: &[u8], request: &mut HttpRequest| {
                let end = chunk.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
                request.set_uri("/");
                Some(end)
            })
        }),
        Priority::NORMAL,
    );
    for _ in 0..3 {
        builder.transform_hooks.push(
            TransformHook::new(|_, _, _| {
                TransformHandler::new(|_, input: &[u8], output: &mut BytesMut| output.extend_from_slice(input))
            }),
            Priority::NORMAL,
        );
    }
    builder.freeze().unwrap()
}

fn bench_select_content(c: &mut Criterion) {
    let pipeline = pipeline();
    let env = env();
    let request = HttpRequest::new();

    c.bench_function("select_content_ten_hooks", |b| {
        b.iter(|| {
            let mut response = HttpResponse::new();
            black_box(pipeline.select_content(&env, &request, &mut response).unwrap());
        });
    });
}

fn bench_downstream(c: &mut Criterion) {
    let pipeline = pipeline();
    let env = env();
    let request = HttpRequest::new();
    let body = vec![b'x'; 4096];

    c.bench_function("downstream_three_transforms", |b| {
        b.iter(|| {
            let mut response = HttpResponse::new();
            let downstream = pipeline.downstream(&env, &request, &mut response).unwrap();
            black_box(downstream.process(&mut response, &body).unwrap());
            black_box(downstream.finish(&mut response).unwrap());
        });
    });
}

fn bench_head_encoder(c: &mut Criterion) {
    let mut response = HttpResponse::new();
    response.set_status(StatusCode::OK);

    c.bench_function("encode_response_head", |b| {
        b.iter(|| {
            let mut bytes = BytesMut::new();
            HeadEncoder.encode((&response, BodySize::Length(12)), &mut bytes).unwrap();
            black_box(bytes);
        });
    });
}

fn bench_http_connection(c: &mut Criterion) {
    let request = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
    let pipeline = Arc::new(pipeline());
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

    c.bench_function("process_simple_request", |b| {
        b.iter(|| {
            let mut output = Vec::new();
            let connection = HttpConnection::new(&request[..], &mut output, Arc::clone(&pipeline), env());
            runtime.block_on(connection.process()).unwrap();
            black_box(output);
        });
    });
}

criterion_group!(benches, bench_select_content, bench_downstream, bench_head_encoder, bench_http_connection);
criterion_main!(benches);
