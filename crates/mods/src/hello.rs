//! `mod_hello`: answers every request with a fixed body.
//!
//! Registered at low priority, so any other content module gets the request
//! first.

use bref_api::content::{ContentHandler, ReadinessSource};
use bref_api::environment::Environment;
use bref_api::module::{API_VERSION, LoadContext, Module, ModuleInfo, Version};
use bref_api::pipeline::{ContentHook, PipelineBuilder, Priority};
use bref_api::protocol::{HeaderValue, HttpRequest, HttpResponse, StatusCode, header};
use bref_api::{Dispose, Owned, owned};
use bytes::BytesMut;
use tracing::info;

pub const NAME: &str = "mod_hello";

const BODY: &[u8] = b"Hello World !";

static INFO: ModuleInfo = ModuleInfo {
    name: NAME,
    description: "answers with a \"Hello World !\" body",
    version: Version::new(0, 1),
    minimum_api_version: API_VERSION,
};

pub fn load(ctx: &LoadContext<'_>) -> Owned<dyn Module> {
    ctx.span.in_scope(|| info!("load module {NAME}"));
    owned!(ModHello)
}

#[derive(Debug)]
pub struct ModHello;

impl Dispose for ModHello {}

impl Module for ModHello {
    fn info(&self) -> &ModuleInfo {
        &INFO
    }

    fn register_hooks(&self, pipeline: &mut PipelineBuilder) {
        pipeline.content_hooks.push(ContentHook::from_fn(generate), Priority::LOW);
    }
}

fn generate(
    _env: &Environment,
    _request: &HttpRequest,
    _response: &mut HttpResponse,
    _source: &mut ReadinessSource,
) -> Option<Owned<dyn ContentHandler>> {
    Some(owned!(Hello))
}

#[derive(Debug)]
struct Hello;

impl Dispose for Hello {}

impl ContentHandler for Hello {
    fn in_content(&mut self, _response: &mut HttpResponse, _chunk: &[u8]) -> bool {
        // the request body is of no interest
        true
    }

    fn out_content(&mut self, response: &mut HttpResponse, output: &mut BytesMut) -> bool {
        response.set_status_line(StatusCode::OK, "OK");
        if let Ok(content_type) = mime::TEXT_PLAIN_UTF_8.as_ref().parse::<HeaderValue>() {
            response.headers_mut().insert(header::CONTENT_TYPE, content_type);
        }
        output.extend_from_slice(BODY);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_body() {
        let mut response = HttpResponse::new();
        let mut output = BytesMut::new();
        let mut hello = Hello;

        assert!(hello.in_content(&mut response, b"ignored"));
        assert!(hello.out_content(&mut response, &mut output));
        assert_eq!(&output[..], b"Hello World !");
        assert_eq!(response.status(), Some(StatusCode::OK));
        assert_eq!(response.reason(), Some("OK"));
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain; charset=utf-8");
    }

    #[test]
    fn test_registers_one_low_priority_content_hook() {
        let mut builder = PipelineBuilder::new();
        ModHello.register_hooks(&mut builder);
        let pipeline = builder.freeze().unwrap();
        assert_eq!(pipeline.priorities(bref_api::pipeline::Stage::Content), vec![Priority::LOW]);
    }
}
