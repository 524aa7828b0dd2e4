//! Hook and handler signatures for every pipeline stage.
//!
//! A hook is asked once per connection (or request) whether it wants to take
//! part. It answers with a handler, or with an empty handler to pass. The
//! aliases at the bottom name the `Function` types modules register.

use bytes::BytesMut;

use crate::content::{ContentHandler, ReadinessSource};
use crate::dispose::Owned;
use crate::environment::{Client, Environment};
use crate::function::{Function, signature};
use crate::protocol::{HttpRequest, HttpResponse};

signature! {
    /// Connection gate: `false` refuses the connection.
    pub struct ConnectionHandlerSig<'a> = fn(response: &'a mut HttpResponse, env: &'a Environment) -> bool;
}

signature! {
    pub struct ConnectionHookSig<'a> = fn(env: &'a Environment) -> ConnectionHandler;
}

signature! {
    /// Raw bytes just read from the client. `false` drops the connection.
    pub struct OnReceiveHandlerSig<'a> = fn(client: &'a Client, buffer: &'a mut BytesMut) -> bool;
}

signature! {
    pub struct OnReceiveHookSig<'a> = fn(env: &'a Environment) -> OnReceiveHandler;
}

signature! {
    /// Bytes about to be written to the client. `false` withholds them.
    pub struct OnSendHandlerSig<'a> = fn(client: &'a Client, data: &'a [u8]) -> bool;
}

signature! {
    pub struct OnSendHookSig<'a> = fn(env: &'a Environment) -> OnSendHandler;
}

signature! {
    /// A stream transform. An empty `input` signals the end of the stream.
    pub struct TransformHandlerSig<'a> = fn(response: &'a mut HttpResponse, input: &'a [u8], output: &'a mut BytesMut) -> ();
}

signature! {
    pub struct PostReceiveHookSig<'a> = fn(env: &'a Environment) -> TransformHandler;
}

signature! {
    /// Feeds one chunk to a request parser. Returns the position in `chunk`
    /// just past the request head once it is complete.
    pub struct ParsingHandlerSig<'a> = fn(response: &'a mut HttpResponse, chunk: &'a [u8], request: &'a mut HttpRequest) -> Option<usize>;
}

signature! {
    pub struct ParsingHookSig<'a> = fn(env: &'a Environment) -> ParsingHandler;
}

signature! {
    /// May rewrite the parsed request and returns a transform for its body.
    pub struct PostParsingHookSig<'a> = fn(env: &'a Environment, request: &'a mut HttpRequest, response: &'a mut HttpResponse) -> TransformHandler;
}

signature! {
    /// Offers to serve a request. A hook that returns a handler may register
    /// a readiness source through `source`.
    pub struct ContentHookSig<'a> = fn(
        env: &'a Environment,
        request: &'a HttpRequest,
        response: &'a mut HttpResponse,
        source: &'a mut ReadinessSource,
    ) -> Option<Owned<dyn ContentHandler>>;
}

signature! {
    /// Shared by the post-content, transform and pre-send stages.
    pub struct DownstreamHookSig<'a> = fn(env: &'a Environment, request: &'a HttpRequest, response: &'a mut HttpResponse) -> TransformHandler;
}

pub type ConnectionHandler = Function<ConnectionHandlerSig>;
pub type ConnectionHook = Function<ConnectionHookSig>;
pub type OnReceiveHandler = Function<OnReceiveHandlerSig>;
pub type OnReceiveHook = Function<OnReceiveHookSig>;
pub type OnSendHandler = Function<OnSendHandlerSig>;
pub type OnSendHook = Function<OnSendHookSig>;
pub type TransformHandler = Function<TransformHandlerSig>;
pub type PostReceiveHook = Function<PostReceiveHookSig>;
pub type ParsingHandler = Function<ParsingHandlerSig>;
pub type ParsingHook = Function<ParsingHookSig>;
pub type PostParsingHook = Function<PostParsingHookSig>;
pub type ContentHook = Function<ContentHookSig>;
pub type PostContentHook = Function<DownstreamHookSig>;
pub type TransformHook = Function<DownstreamHookSig>;
pub type PreSendHook = Function<DownstreamHookSig>;
