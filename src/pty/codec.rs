//! Typed NDJSON codec for the helper process line protocol.
//!
//! One JSON object per `\n`-terminated line in both directions. Decoding
//! yields parsed messages rather than raw strings: a line that is not valid
//! for the inbound type comes back as [`Decoded::Invalid`] and the stream
//! keeps going. A line longer than [`MAX_LINE_BYTES`] is reported once and
//! skipped up to its newline, so a helper that never emits one cannot grow
//! the read buffer without bound.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::pty::protocol::{parse_helper_line, ControlMessage, HelperLine, HelperMessage};
use crate::{AppError, Result};

/// Maximum helper line length: 4 MiB.
///
/// Output chunks are base64-encoded 4 KiB reads, so legitimate lines stay
/// far below this.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Characters of an offending line kept in [`Decoded::Invalid`].
const PREVIEW_CHARS: usize = 120;

/// A message type that can be read from one protocol line.
pub trait LineMessage: Sized {
    /// Parse one non-blank line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bridge` when the line is not a valid message.
    fn parse_line(line: &str) -> Result<Self>;
}

impl LineMessage for HelperLine {
    fn parse_line(line: &str) -> Result<Self> {
        parse_helper_line(line)?.ok_or_else(|| AppError::Bridge("empty helper line".into()))
    }
}

impl LineMessage for ControlMessage {
    fn parse_line(line: &str) -> Result<Self> {
        serde_json::from_str(line)
            .map_err(|e| AppError::Bridge(format!("malformed control message: {e}")))
    }
}

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    /// A well-formed message.
    Message(T),
    /// A line that could not be used; decoding continues after it.
    Invalid {
        /// What was wrong with it.
        reason: String,
        /// Leading characters of the line.
        preview: String,
    },
}

/// Line codec reading `In` and writing `Out`.
pub struct JsonLinesCodec<In, Out> {
    max_length: usize,
    next_index: usize,
    discarding: bool,
    types: PhantomData<fn(Out) -> In>,
}

/// Server side of the helper pipe: reads helper lines, writes control messages.
pub type ServerCodec = JsonLinesCodec<HelperLine, ControlMessage>;

/// Helper side of the pipe: reads control messages, writes helper messages.
pub type HelperCodec = JsonLinesCodec<ControlMessage, HelperMessage>;

impl<In, Out> JsonLinesCodec<In, Out> {
    /// Codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_length: MAX_LINE_BYTES,
            next_index: 0,
            discarding: false,
            types: PhantomData,
        }
    }

    fn overlong(&self, bytes: &[u8]) -> Decoded<In> {
        Decoded::Invalid {
            reason: format!("line too long: exceeded {} bytes", self.max_length),
            preview: preview(&String::from_utf8_lossy(&bytes[..bytes.len().min(PREVIEW_CHARS)])),
        }
    }
}

impl<In, Out> Default for JsonLinesCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out> std::fmt::Debug for JsonLinesCodec<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesCodec")
            .field("max_length", &self.max_length)
            .field("next_index", &self.next_index)
            .field("discarding", &self.discarding)
            .finish_non_exhaustive()
    }
}

fn preview(line: &str) -> String {
    line.chars().take(PREVIEW_CHARS).collect()
}

fn decode_line<In: LineMessage>(bytes: &[u8]) -> Option<Decoded<In>> {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(match In::parse_line(trimmed) {
        Ok(message) => Decoded::Message(message),
        Err(err) => Decoded::Invalid {
            reason: err.to_string(),
            preview: preview(trimmed),
        },
    })
}

impl<In: LineMessage, Out> Decoder for JsonLinesCodec<In, Out> {
    type Item = Decoded<In>;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Decoded<In>>> {
        loop {
            let newline = src[self.next_index..]
                .iter()
                .position(|byte| *byte == b'\n')
                .map(|offset| self.next_index + offset);

            match newline {
                Some(end) if self.discarding => {
                    src.advance(end + 1);
                    self.next_index = 0;
                    self.discarding = false;
                }
                Some(end) => {
                    let line = src.split_to(end + 1);
                    self.next_index = 0;
                    if end > self.max_length {
                        return Ok(Some(self.overlong(&line)));
                    }
                    if let Some(decoded) = decode_line(&line[..end]) {
                        return Ok(Some(decoded));
                    }
                }
                None if self.discarding => {
                    src.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                None if src.len() > self.max_length => {
                    let decoded = self.overlong(src);
                    src.clear();
                    self.next_index = 0;
                    self.discarding = true;
                    return Ok(Some(decoded));
                }
                None => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Decoded<In>>> {
        if let Some(decoded) = self.decode(src)? {
            return Ok(Some(decoded));
        }
        let rest = src.split();
        self.next_index = 0;
        if std::mem::take(&mut self.discarding) {
            return Ok(None);
        }
        Ok(decode_line(&rest))
    }
}

impl<In, Out: Serialize> Encoder<Out> for JsonLinesCodec<In, Out> {
    type Error = AppError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<()> {
        let line = serde_json::to_vec(&item)
            .map_err(|e| AppError::Bridge(format!("failed to serialise line: {e}")))?;
        dst.reserve(line.len() + 1);
        dst.put_slice(&line);
        dst.put_u8(b'\n');
        Ok(())
    }
}
