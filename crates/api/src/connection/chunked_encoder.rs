use std::io;
use std::io::Write;

use bytes::BytesMut;
use tokio_util::codec::Encoder;

use super::head_encoder::FastWrite;

/// A piece of a streamed response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyItem<'a> {
    Chunk(&'a [u8]),
    Eof,
}

/// Frames body pieces with chunked transfer encoding.
///
/// Empty chunks are skipped, since a zero-sized chunk ends the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkedEncoder {
    eof: bool,
}

impl ChunkedEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a> Encoder<BodyItem<'a>> for ChunkedEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: BodyItem<'a>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.eof {
            return Ok(());
        }

        match item {
            BodyItem::Chunk(data) if data.is_empty() => Ok(()),
            BodyItem::Chunk(data) => {
                write!(FastWrite(dst), "{:X}\r\n", data.len())?;
                dst.reserve(data.len() + 2);
                dst.extend_from_slice(data);
                dst.extend_from_slice(b"\r\n");
                Ok(())
            }
            BodyItem::Eof => {
                self.eof = true;
                dst.extend_from_slice(b"0\r\n\r\n");
                Ok(())
            }
        }
    }
}
