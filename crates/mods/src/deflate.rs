//! `mod_deflate`: compresses response bodies.
//!
//! The encoding is picked from the request's `Accept-Encoding`, preferring
//! zstd, then brotli, gzip and deflate. Error responses, bodiless statuses
//! and responses that already carry a `Content-Encoding` are left alone.
//!
//! The encoder and writer are adapted from actix-http's
//! `encoding/encoder.rs`.

use std::io::{self, Write};
use std::sync::Mutex;

use bref_api::environment::Environment;
use bref_api::module::{API_VERSION, LoadContext, Module, ModuleInfo, Version};
use bref_api::pipeline::{PipelineBuilder, Priority, TransformHandler, TransformHook};
use bref_api::protocol::{HeaderValue, HttpRequest, HttpResponse, StatusCode, header};
use bref_api::{Dispose, Owned, owned};
use bytes::{Bytes, BytesMut};
use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};
use tracing::{debug, error, info, trace};
use zstd::stream::write::Encoder as ZstdEncoder;

pub const NAME: &str = "mod_deflate";

static INFO: ModuleInfo = ModuleInfo {
    name: NAME,
    description: "compresses response bodies",
    version: Version::new(0, 1),
    minimum_api_version: API_VERSION,
};

pub fn load(ctx: &LoadContext<'_>) -> Owned<dyn Module> {
    ctx.span.in_scope(|| info!("load module {NAME}"));
    owned!(ModDeflate)
}

#[derive(Debug)]
pub struct ModDeflate;

impl Dispose for ModDeflate {}

impl Module for ModDeflate {
    fn info(&self) -> &ModuleInfo {
        &INFO
    }

    fn register_hooks(&self, pipeline: &mut PipelineBuilder) {
        // compress what the other transforms produced
        pipeline.transform_hooks.push(TransformHook::from_fn(encode), Priority::LOW);
    }
}

/// Collects compressed output in memory.
struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn new() -> Self {
        Self { buf: BytesMut::with_capacity(4096) }
    }

    fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Represents different types of content encoding.
enum Encoder {
    Gzip(GzEncoder<Writer>),
    Deflate(ZlibEncoder<Writer>),
    Zstd(ZstdEncoder<'static, Writer>),
    Br(Box<brotli::CompressorWriter<Writer>>),
}

impl Encoder {
    fn gzip() -> Self {
        Self::Gzip(GzEncoder::new(Writer::new(), Compression::best()))
    }

    fn deflate() -> Self {
        Self::Deflate(ZlibEncoder::new(Writer::new(), Compression::best()))
    }

    fn zstd() -> io::Result<Self> {
        ZstdEncoder::new(Writer::new(), 6).map(Self::Zstd)
    }

    fn br() -> Self {
        Self::Br(Box::new(brotli::CompressorWriter::new(
            Writer::new(),
            32 * 1024, // 32 KiB buffer
            3,         // BROTLI_PARAM_QUALITY
            22,        // BROTLI_PARAM_LGWIN
        )))
    }

    /// Selects an encoder based on the `Accept-Encoding` header.
    fn select(accept_encodings: &str) -> Option<Self> {
        if accepts(accept_encodings, "zstd") {
            match Self::zstd() {
                Ok(encoder) => return Some(encoder),
                Err(e) => debug!(cause = %e, "can't create zstd encoder"),
            }
        }
        if accepts(accept_encodings, "br") {
            Some(Self::br())
        } else if accepts(accept_encodings, "gzip") {
            Some(Self::gzip())
        } else if accepts(accept_encodings, "deflate") {
            Some(Self::deflate())
        } else {
            None
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Encoder::Gzip(_) => "gzip",
            Encoder::Deflate(_) => "deflate",
            Encoder::Zstd(_) => "zstd",
            Encoder::Br(_) => "br",
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let result = match self {
            Self::Gzip(encoder) => encoder.write_all(data),
            Self::Deflate(encoder) => encoder.write_all(data),
            Self::Zstd(encoder) => encoder.write_all(data),
            Self::Br(encoder) => encoder.write_all(data),
        };
        if let Err(err) = &result {
            trace!("error encoding {}: {}", self.name(), err);
        }
        result
    }

    /// Takes the encoded data produced so far.
    fn take(&mut self) -> Bytes {
        match self {
            Self::Gzip(encoder) => encoder.get_mut().take(),
            Self::Deflate(encoder) => encoder.get_mut().take(),
            Self::Zstd(encoder) => encoder.get_mut().take(),
            Self::Br(encoder) => encoder.get_mut().take(),
        }
    }

    /// Finishes the stream and returns the remaining encoded data.
    fn finish(self) -> io::Result<Bytes> {
        match self {
            Self::Gzip(encoder) => encoder.finish().map(|writer| writer.buf.freeze()),
            Self::Deflate(encoder) => encoder.finish().map(|writer| writer.buf.freeze()),
            Self::Zstd(encoder) => encoder.finish().map(|writer| writer.buf.freeze()),
            Self::Br(mut encoder) => encoder.flush().map(|()| encoder.into_inner().buf.freeze()),
        }
    }
}

/// Whether `coding` is listed in an `Accept-Encoding` value without `q=0`.
fn accepts(accept_encodings: &str, coding: &str) -> bool {
    accept_encodings.split(',').any(|item| {
        let mut params = item.split(';');
        let name = params.next().unwrap_or_default().trim();
        let refused = params.any(|param| {
            param.trim().strip_prefix("q=").and_then(|q| q.trim().parse::<f32>().ok()).is_some_and(|q| q <= 0.0)
        });
        name.eq_ignore_ascii_case(coding) && !refused
    })
}

fn compressible(response: &HttpResponse) -> bool {
    let Some(status) = response.status() else {
        return false;
    };
    let bodiless = status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED;
    !bodiless && !response.is_error() && !response.headers().contains_key(header::CONTENT_ENCODING)
}

fn encode(_env: &Environment, request: &HttpRequest, response: &mut HttpResponse) -> TransformHandler {
    if !compressible(response) {
        return TransformHandler::empty();
    }
    let Some(encoder) = request.header_str(header::ACCEPT_ENCODING).and_then(Encoder::select) else {
        return TransformHandler::empty();
    };

    debug!(encoding = encoder.name(), "compressing response body");
    response.headers_mut().insert(header::CONTENT_ENCODING, HeaderValue::from_static(encoder.name()));
    response.headers_mut().append(header::VARY, HeaderValue::from_static("accept-encoding"));

    let encoder = Mutex::new(Some(encoder));
    TransformHandler::new(move |_response: &mut HttpResponse, input: &[u8], output: &mut BytesMut| {
        let Ok(mut slot) = encoder.lock() else {
            error!("encoder state poisoned");
            return;
        };
        if input.is_empty() {
            if let Some(encoder) = slot.take() {
                match encoder.finish() {
                    Ok(bytes) => output.extend_from_slice(&bytes),
                    Err(e) => error!(cause = %e, "can't finish response encoding"),
                }
            }
            return;
        }
        if let Some(encoder) = slot.as_mut() {
            match encoder.write(input) {
                Ok(()) => output.extend_from_slice(&encoder.take()),
                Err(e) => error!(cause = %e, "can't encode response body"),
            }
        }
    })
}
