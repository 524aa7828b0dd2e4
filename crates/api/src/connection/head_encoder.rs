//! Serializes a response head into raw bytes.
//!
//! The host decides the body framing: `Content-Length` when the whole body
//! was produced before the head is written, chunked transfer encoding when
//! it is streamed. Framing headers set by hooks are replaced.

use std::io;
use std::io::{ErrorKind, Write};

use bytes::{BufMut, BytesMut};
use http::{StatusCode, Version, header};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::protocol::HttpResponse;

/// Initial buffer size allocated for head serialization
const INIT_HEAD_SIZE: usize = 4 * 1024;

/// How the body following a head is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySize {
    /// The body is complete and this long.
    Length(usize),
    /// The body is streamed with chunked transfer encoding.
    Chunked,
}

/// Encodes `(response, body size)` as a status line and header block.
#[derive(Debug, Default)]
pub struct HeadEncoder;

impl<'a> Encoder<(&'a HttpResponse, BodySize)> for HeadEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: (&'a HttpResponse, BodySize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (response, body_size) = item;

        let version = match response.version() {
            Version::HTTP_11 => "HTTP/1.1",
            Version::HTTP_10 => "HTTP/1.0",
            v => {
                error!(http_version = ?v, "unsupported http version");
                return Err(io::Error::from(ErrorKind::Unsupported));
            }
        };
        // an unset status at this point is the caller's bug, answer as a server error
        let status = response.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let reason = response.reason().or_else(|| status.canonical_reason()).unwrap_or_default();

        dst.reserve(INIT_HEAD_SIZE);
        write!(FastWrite(dst), "{} {} {}\r\n", version, status.as_str(), reason)?;

        for (name, value) in response.headers() {
            if *name == header::CONTENT_LENGTH || *name == header::TRANSFER_ENCODING {
                continue;
            }
            dst.put_slice(name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(value.as_ref());
            dst.put_slice(b"\r\n");
        }
        match body_size {
            BodySize::Length(n) => write!(FastWrite(dst), "content-length: {n}\r\n")?,
            BodySize::Chunked => dst.put_slice(b"transfer-encoding: chunked\r\n"),
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Writer over a `BytesMut` that has already reserved room for the head.
pub(super) struct FastWrite<'a>(pub(super) &'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
