use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use http::header::{CONNECTION, CONTENT_LENGTH, EXPECT, TRANSFER_ENCODING};
use http::{HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Encoder;
use tracing::{Instrument, debug, error, info, trace, warn};

use crate::content::{ContentState, ContentStream};
use crate::dispose::Owned;
use crate::environment::Environment;
use crate::module::Session;
use crate::pipeline::{Downstream, ParsingHandler, Pipeline, PipelineError, Stage, TransformChain};
use crate::protocol::{HttpRequest, HttpResponse};

use super::ConnectionError;
use super::chunked_encoder::{BodyItem, ChunkedEncoder};
use super::head_encoder::{BodySize, HeadEncoder};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Whether the connection stays open after a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    KeepAlive,
    Close,
}

/// How a response body was produced.
enum Output {
    /// The whole body, sent with a `Content-Length`.
    Buffered(BytesMut),
    /// Already streamed to the peer; `false` if the send gate withheld part of it.
    Streamed(bool),
}

/// Drives one client connection through the pipeline.
///
/// `HttpConnection` owns the read and write halves of a connection and
/// serves requests on it until the peer closes, a gate refuses, or a
/// response asks to close:
///
/// 1. the connection gate decides whether to serve the peer at all
/// 2. every module may open a session for the connection
/// 3. per request: read through the on-receive gate and post-receive chain,
///    parse, run sessions and post-parsing hooks, pick a content handler,
///    feed it the body, pull its output through the downstream chains and
///    write the response through the on-send gate
///
/// A body that is complete after the first pull is sent with a
/// `Content-Length`. Otherwise HTTP/1.1 clients get each piece as it is
/// produced, framed with chunked transfer encoding.
///
/// # Type Parameters
///
/// * `R`: The async readable stream type
/// * `W`: The async writable stream type
pub struct HttpConnection<R, W> {
    reader: R,
    writer: W,
    pipeline: Arc<Pipeline>,
    env: Environment,
    // received bytes that went through post-receive but were not consumed yet
    pending: BytesMut,
    // the peer closed its side and post-receive was flushed
    eof: bool,
    // a chunked body is being written, the head is already out
    streaming: bool,
}

impl<R, W> HttpConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, pipeline: Arc<Pipeline>, env: Environment) -> Self {
        Self { reader, writer, pipeline, env, pending: BytesMut::new(), eof: false, streaming: false }
    }

    /// Serves the connection until it closes.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the connection. Pipeline and content
    /// errors are answered with a 500 before being returned.
    pub async fn process(self) -> Result<(), ConnectionError> {
        let span = self.env.span().clone();
        self.run().instrument(span).await
    }

    async fn run(mut self) -> Result<(), ConnectionError> {
        let mut response = HttpResponse::new();
        if !self.pipeline.accept_connection(&mut response, &self.env)? {
            info!(status = ?response.status(), "connection refused");
            if response.status().is_some() {
                self.send_response(&mut response, &BytesMut::new(), false, Next::Close).await?;
            }
            return Ok(());
        }

        let mut sessions = self.pipeline.open_sessions(&self.env);
        debug!(sessions = sessions.len(), "connection accepted");
        let post_receive = self.pipeline.post_receive_chain(&self.env)?;

        let result = loop {
            match self.serve(&post_receive, &mut sessions).await {
                Ok(Next::KeepAlive) => {}
                Ok(Next::Close) => break Ok(()),
                Err(e) => {
                    error!(cause = %e, "request processing failed");
                    if e.is_recoverable() && !self.streaming {
                        let mut response = HttpResponse::new();
                        response.set_status(StatusCode::INTERNAL_SERVER_ERROR);
                        if let Err(send_error) = self.send_response(&mut response, &BytesMut::new(), false, Next::Close).await {
                            debug!(cause = %send_error, "can't send error response");
                        }
                    }
                    break Err(e);
                }
            }
        };

        if !self.eof {
            // end of stream for post-receive handlers, nothing is left to parse
            match post_receive.finish(&mut HttpResponse::new(), &[]) {
                Ok(rest) => trace!(dropped = rest.len(), "post-receive flushed at close"),
                Err(e) => debug!(cause = %e, "can't flush post-receive"),
            }
        }

        // sessions are disposed here, before the connection goes away
        drop(sessions);
        info!("connection closed");
        result
    }

    async fn serve(
        &mut self,
        post_receive: &TransformChain,
        sessions: &mut [Owned<dyn Session>],
    ) -> Result<Next, ConnectionError> {
        let mut request = HttpRequest::new();
        let mut response = HttpResponse::new();

        let Some(parser) = self.pipeline.select_parser(&self.env)? else {
            error!("no parsing hook answered for this connection");
            response.set_status(StatusCode::INTERNAL_SERVER_ERROR);
            self.send_response(&mut response, &BytesMut::new(), false, Next::Close).await?;
            return Ok(Next::Close);
        };

        if !self.read_head(&parser, post_receive, &mut request, &mut response).await? {
            return Ok(Next::Close);
        }
        if request.version() == Version::HTTP_10 {
            response.set_version(Version::HTTP_10);
        }
        if response.is_error() {
            warn!(status = ?response.status(), "request head rejected");
            self.send_response(&mut response, &BytesMut::new(), false, Next::Close).await?;
            return Ok(Next::Close);
        }
        info!(method = ?request.method(), uri = request.uri(), version = ?request.version(), "request received");

        for session in sessions.iter_mut() {
            session.on_request(&request, &mut response);
        }

        let post_parsing = self.pipeline.post_parsing_chain(&self.env, &mut request, &mut response)?;

        let body_length = match body_length(&request) {
            Ok(length) => length,
            Err(status) => {
                warn!(status = ?status, "unsupported request body framing");
                response.set_status(status);
                self.send_response(&mut response, &BytesMut::new(), false, Next::Close).await?;
                return Ok(Next::Close);
            }
        };

        let content = if response.is_error() {
            None
        } else {
            self.pipeline.select_content(&self.env, &request, &mut response)?
        };

        let (body, next) = match content {
            Some(mut stream) => {
                if body_length > 0 && expects_continue(&request) {
                    self.writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
                    self.writer.flush().await?;
                    debug!("sent 100 continue");
                }
                if !self.feed_body(body_length, post_receive, &post_parsing, &mut stream, &mut response).await? {
                    return Ok(Next::Close);
                }
                let next = if request.keep_alive() { Next::KeepAlive } else { Next::Close };
                match self.generate(stream, &request, &mut response, next).await? {
                    Output::Buffered(body) => (body, next),
                    Output::Streamed(true) => return Ok(next),
                    Output::Streamed(false) => return Ok(Next::Close),
                }
            }
            None => {
                if !response.is_error() {
                    debug!(uri = request.uri(), "no content handler for request");
                    response.set_status(StatusCode::NOT_FOUND);
                }
                let body = self.pipeline.downstream(&self.env, &request, &mut response)?.finish(&mut response)?;
                // an unread body would be taken for the next request
                let next = if body_length == 0 && request.keep_alive() { Next::KeepAlive } else { Next::Close };
                (body, next)
            }
        };

        let head_only = request.method() == Some(&Method::HEAD);
        if !self.send_response(&mut response, &body, head_only, next).await? {
            return Ok(Next::Close);
        }
        Ok(next)
    }

    /// Feeds received bytes to `parser` until the request head is complete.
    ///
    /// Returns `false` when the peer went away first.
    async fn read_head(
        &mut self,
        parser: &ParsingHandler,
        post_receive: &TransformChain,
        request: &mut HttpRequest,
        response: &mut HttpResponse,
    ) -> Result<bool, ConnectionError> {
        loop {
            if self.pending.is_empty() {
                if !self.receive(post_receive, response).await? {
                    return Ok(false);
                }
                continue;
            }

            let mut chunk = self.pending.split();
            let consumed = parser
                .call((&mut *response, &chunk[..], &mut *request))
                .map_err(|_| PipelineError::empty_call(Stage::Parsing))?;
            match consumed {
                Some(position) => {
                    self.pending = chunk.split_off(position.min(chunk.len()));
                    trace!(leftover = self.pending.len(), "request head parsed");
                    return Ok(true);
                }
                // the parser gave up on this request
                None if response.is_error() => return Ok(true),
                None => {}
            }
        }
    }

    /// Reads once from the peer. Returns `false` on end of stream or when the
    /// on-receive gate refuses the data.
    ///
    /// At end of stream the post-receive chain is flushed once; whatever it
    /// still held is made available as a last read.
    async fn receive(&mut self, post_receive: &TransformChain, response: &mut HttpResponse) -> Result<bool, ConnectionError> {
        if self.eof {
            return Ok(false);
        }
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        if self.reader.read_buf(&mut buffer).await? == 0 {
            trace!("peer closed the connection");
            self.eof = true;
            let rest = post_receive.finish(response, &[])?;
            if rest.is_empty() {
                return Ok(false);
            }
            self.pending.extend_from_slice(&rest);
            return Ok(true);
        }
        if !self.pipeline.accept_received(&self.env, &mut buffer)? {
            warn!(len = buffer.len(), "received data refused");
            return Ok(false);
        }
        let data = post_receive.process(response, &buffer)?;
        self.pending.extend_from_slice(&data);
        Ok(true)
    }

    /// Delivers `length` body bytes to the content handler, then the end
    /// marker. Bytes arriving after the handler stopped accepting input are
    /// read and dropped. Returns `false` if the peer went away mid-body.
    async fn feed_body(
        &mut self,
        length: usize,
        post_receive: &TransformChain,
        post_parsing: &TransformChain,
        stream: &mut ContentStream,
        response: &mut HttpResponse,
    ) -> Result<bool, ConnectionError> {
        let mut remaining = length;
        while remaining > 0 {
            if self.pending.is_empty() && !self.receive(post_receive, response).await? {
                warn!(remaining, "peer closed before the request body was complete");
                return Ok(false);
            }
            let take = remaining.min(self.pending.len());
            let chunk = self.pending.split_to(take);
            remaining -= take;

            if !stream.input_closed() {
                let data = post_parsing.process(response, &chunk)?;
                if !data.is_empty() {
                    stream.push_input(response, &data)?;
                }
            }
        }

        if !stream.input_closed() {
            let tail = post_parsing.finish(response, &[])?;
            if !tail.is_empty() {
                stream.push_input(response, &tail)?;
            }
            if !stream.input_closed() {
                stream.push_input(response, &[])?;
            }
        }
        Ok(true)
    }

    /// Pulls the handler's output through the downstream chains.
    ///
    /// The body is streamed when the handler is not done after the first
    /// pull and the client can take a chunked body; it is buffered otherwise.
    async fn generate(
        &mut self,
        mut stream: ContentStream,
        request: &HttpRequest,
        response: &mut HttpResponse,
        next: Next,
    ) -> Result<Output, ConnectionError> {
        let mut chunk = BytesMut::new();
        let mut done = stream.pull_output(response, &mut chunk).await?;
        // downstream hooks are asked once the handler had a chance to set the status
        let downstream = self.pipeline.downstream(&self.env, request, response)?;

        let chunked = request.version() == Version::HTTP_11 && request.method() != Some(&Method::HEAD);
        if !done && chunked {
            let sent = self.stream_body(&mut stream, &downstream, chunk, request, response, next).await?;
            stream.release();
            return Ok(Output::Streamed(sent));
        }

        let mut body = BytesMut::new();
        loop {
            if !chunk.is_empty() {
                body.extend_from_slice(&downstream.process(response, &chunk)?);
                chunk.clear();
            }
            if done {
                break;
            }
            if stream.source().is_none() {
                tokio::task::yield_now().await;
            }
            done = stream.pull_output(response, &mut chunk).await?;
        }
        stream.release();

        ensure_status(request, response);
        body.extend_from_slice(&downstream.finish(response)?);
        Ok(Output::Buffered(body))
    }

    /// Sends the head, then every piece of output as a chunk as soon as it
    /// passed the downstream chains. Returns `false` if the send gate
    /// withheld part of the response.
    async fn stream_body(
        &mut self,
        stream: &mut ContentStream,
        downstream: &Downstream,
        mut chunk: BytesMut,
        request: &HttpRequest,
        response: &mut HttpResponse,
        next: Next,
    ) -> Result<bool, ConnectionError> {
        ensure_status(request, response);
        set_connection_header(response, next);
        let mut out = BytesMut::new();
        HeadEncoder.encode((&*response, BodySize::Chunked), &mut out)?;
        if !self.send(&out).await? {
            return Ok(false);
        }
        self.streaming = true;
        debug!(status = ?response.status(), "streaming response");

        let mut encoder = ChunkedEncoder::new();
        let mut sent = 0;
        loop {
            if !chunk.is_empty() {
                let data = downstream.process(response, &chunk)?;
                chunk.clear();
                if !data.is_empty() {
                    out.clear();
                    encoder.encode(BodyItem::Chunk(&data), &mut out)?;
                    if !self.send(&out).await? {
                        return Ok(false);
                    }
                    sent += data.len();
                }
            }
            if stream.state() == ContentState::Done {
                break;
            }
            if stream.source().is_none() {
                tokio::task::yield_now().await;
            }
            stream.pull_output(response, &mut chunk).await?;
        }

        let tail = downstream.finish(response)?;
        out.clear();
        encoder.encode(BodyItem::Chunk(&tail), &mut out)?;
        encoder.encode(BodyItem::Eof, &mut out)?;
        if !self.send(&out).await? {
            return Ok(false);
        }
        self.streaming = false;
        info!(status = ?response.status(), body = sent + tail.len(), "response streamed");
        Ok(true)
    }

    /// Encodes and writes a response through the on-send gate. Returns
    /// `false` if the gate withheld it.
    async fn send_response(
        &mut self,
        response: &mut HttpResponse,
        body: &[u8],
        head_only: bool,
        next: Next,
    ) -> Result<bool, ConnectionError> {
        set_connection_header(response, next);

        let mut out = BytesMut::new();
        HeadEncoder.encode((&*response, BodySize::Length(body.len())), &mut out)?;
        if !head_only {
            out.extend_from_slice(body);
        }

        if !self.send(&out).await? {
            return Ok(false);
        }
        info!(status = ?response.status(), body = body.len(), "response sent");
        Ok(true)
    }

    /// Writes `out` to the peer through the on-send gate. Returns `false` if
    /// the gate withheld it.
    async fn send(&mut self, out: &[u8]) -> Result<bool, ConnectionError> {
        if !self.pipeline.accept_send(&self.env, out)? {
            warn!(len = out.len(), "data withheld by send gate");
            return Ok(false);
        }
        self.writer.write_all(out).await?;
        self.writer.flush().await?;
        Ok(true)
    }
}

impl<R, W> fmt::Debug for HttpConnection<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("env", &self.env)
            .field("pending", &self.pending.len())
            .field("eof", &self.eof)
            .field("streaming", &self.streaming)
            .finish_non_exhaustive()
    }
}

fn set_connection_header(response: &mut HttpResponse, next: Next) {
    if next == Next::Close {
        response.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
    } else if response.version() == Version::HTTP_10 {
        response.headers_mut().insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    }
}

/// A handler that produced output without setting a status failed to say
/// what it answered.
fn ensure_status(request: &HttpRequest, response: &mut HttpResponse) {
    if response.status().is_none() {
        warn!(uri = request.uri(), "content handler produced output without a status");
        response.set_status(StatusCode::INTERNAL_SERVER_ERROR);
    }
}

/// Request body length from `Content-Length`. Chunked request bodies are
/// answered with 411 so the client retries with a length.
fn body_length(request: &HttpRequest) -> Result<usize, StatusCode> {
    if request.headers().contains_key(TRANSFER_ENCODING) {
        return Err(StatusCode::LENGTH_REQUIRED);
    }
    match request.headers().get(CONTENT_LENGTH) {
        None => Ok(0),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .ok_or(StatusCode::BAD_REQUEST),
    }
}

fn expects_continue(request: &HttpRequest) -> bool {
    request.version() == Version::HTTP_11
        && request.headers().get(EXPECT).is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"))
}
