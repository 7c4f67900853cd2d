//! WebSocket frame encoding and decoding.
//!
//! Pure functions ([`encode_frame`], [`decode_frame`], [`apply_mask`]) do the
//! byte work; [`FrameCodec`] wraps them for
//! [`tokio_util::codec::FramedRead`] / [`FramedWrite`](tokio_util::codec::FramedWrite)
//! so a connection can treat its socket as a stream of [`Frame`]s.
//!
//! Layout: `[fin:1|rsv:3|opcode:4][mask:1|len:7][ext len 16/64][mask key 4][payload]`.
//! Server frames are never masked. [`decode_frame`] accepts either; the
//! server-side [`FrameCodec`] insists on masked client frames.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{AppError, Result};

/// Payload lengths below this value fit in the 7-bit length field.
const SMALL_PAYLOAD_LIMIT: usize = 126;

/// Payload lengths below this value use the 16-bit extended length.
const MEDIUM_PAYLOAD_LIMIT: usize = 65_536;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Continuation of a fragmented message (`0x0`).
    Continuation,
    /// UTF-8 text payload (`0x1`).
    Text,
    /// Binary payload (`0x2`).
    Binary,
    /// Connection close (`0x8`).
    Close,
    /// Ping (`0x9`).
    Ping,
    /// Pong (`0xA`).
    Pong,
    /// Any reserved opcode value.
    Reserved(u8),
}

impl Opcode {
    /// Decode the low four bits of the first header byte.
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x0f {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    /// Wire value of the opcode.
    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(bits) => bits & 0x0f,
        }
    }
}

/// Close status codes used by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: normal closure.
    Normal,
    /// 1002: protocol error (fragmented or unmasked client frames).
    ProtocolError,
    /// 1003: unsupported data (unknown opcode).
    Unsupported,
    /// 1009: message too big.
    TooBig,
}

impl CloseCode {
    /// Numeric close code.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::ProtocolError => 1002,
            Self::Unsupported => 1003,
            Self::TooBig => 1009,
        }
    }
}

/// One decoded (already unmasked) or to-be-encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// FIN bit; `false` marks a fragment.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    /// Final frame with the given opcode and payload.
    #[must_use]
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    /// Text frame.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Text, payload)
    }

    /// Pong frame echoing `payload`.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Close frame carrying a status code and optional UTF-8 reason.
    #[must_use]
    pub fn close(code: CloseCode, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code.code());
        payload.put_slice(reason.as_bytes());
        Self::new(Opcode::Close, payload.freeze())
    }

    /// Status code carried by a close frame, if any.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        (self.opcode == Opcode::Close && self.payload.len() >= 2)
            .then(|| u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }
}

/// XOR `data` in place with the 4-byte masking key.
///
/// Masking is an involution: applying the same key twice restores the input.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Append the wire encoding of `frame` to `dst`.
///
/// When `mask` is `Some`, the payload is masked with that key and the mask
/// bit is set. The server never masks; clients (and tests) do.
pub fn encode_frame(frame: &Frame, mask: Option<[u8; 4]>, dst: &mut BytesMut) {
    let len = frame.payload.len();
    let fin_bit = if frame.fin { 0x80 } else { 0x00 };
    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };

    dst.reserve(len + 14);
    dst.put_u8(fin_bit | frame.opcode.bits());

    if len < SMALL_PAYLOAD_LIMIT {
        // `len` is below 126 here, so the cast is lossless.
        #[allow(clippy::cast_possible_truncation)]
        dst.put_u8(mask_bit | len as u8);
    } else if len < MEDIUM_PAYLOAD_LIMIT {
        dst.put_u8(mask_bit | 126);
        #[allow(clippy::cast_possible_truncation)]
        dst.put_u16(len as u16);
    } else {
        dst.put_u8(mask_bit | 127);
        dst.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            apply_mask(&mut dst[start..], key);
        }
        None => dst.put_slice(&frame.payload),
    }
}

/// Try to slice one complete frame off the front of `src`.
///
/// Returns `Ok(None)` while the header, mask key or payload is still
/// incomplete; nothing is consumed in that case. Masked payloads are
/// unmasked before being returned.
///
/// # Errors
///
/// Returns `AppError::Protocol` when the declared payload length exceeds
/// `max_payload`. The buffer is left untouched so the caller can close.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < 2 {
        return Ok(None);
    }

    let first = src[0];
    let second = src[1];
    let fin = first & 0x80 != 0;
    let opcode = Opcode::from_bits(first);
    let masked = second & 0x80 != 0;

    let mut offset = 2;
    let declared: u64 = match second & 0x7f {
        126 => {
            if src.len() < offset + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([src[2], src[3]]);
            offset += 2;
            u64::from(len)
        }
        127 => {
            if src.len() < offset + 8 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&src[2..10]);
            offset += 8;
            u64::from_be_bytes(raw)
        }
        small => u64::from(small),
    };

    let payload_len = usize::try_from(declared)
        .ok()
        .filter(|len| *len <= max_payload)
        .ok_or_else(|| {
            AppError::Protocol(format!(
                "frame payload of {declared} bytes exceeds limit of {max_payload}"
            ))
        })?;

    let mask_len = if masked { 4 } else { 0 };
    let total = offset + mask_len + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    let mask_key = masked.then(|| [src[offset], src[offset + 1], src[offset + 2], src[offset + 3]]);
    src.advance(offset + mask_len);
    let mut payload = src.split_to(payload_len);
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    Ok(Some(Frame {
        fin,
        opcode,
        payload: payload.freeze(),
    }))
}

/// Why [`FrameCodec`] stopped reading the inbound stream.
#[derive(Debug)]
pub enum FrameError {
    /// The peer broke a framing rule; the connection closes with `code`.
    Violation {
        /// Close code to answer with.
        code: CloseCode,
        /// Close reason and log detail.
        reason: String,
    },
    /// Socket failure.
    Io(std::io::Error),
}

impl FrameError {
    fn violation(code: CloseCode, reason: impl Into<String>) -> Self {
        Self::Violation {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Violation { code, reason } => write!(f, "close {}: {reason}", code.code()),
            Self::Io(err) => write!(f, "io: {err}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Violation { .. } => None,
        }
    }
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Server-side streaming codec over [`decode_frame`] / [`encode_frame`].
///
/// Inbound frames must be masked and within the payload cap. Outbound
/// frames are written unmasked.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    /// Codec rejecting inbound payloads larger than `max_payload` bytes.
    #[must_use]
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Frame>, FrameError> {
        if src.len() >= 2 && src[1] & 0x80 == 0 {
            return Err(FrameError::violation(
                CloseCode::ProtocolError,
                "client frames must be masked",
            ));
        }
        decode_frame(src, self.max_payload).map_err(|err| match err {
            AppError::Protocol(detail) => FrameError::violation(CloseCode::TooBig, detail),
            other => FrameError::violation(CloseCode::ProtocolError, other.to_string()),
        })
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> std::result::Result<(), FrameError> {
        encode_frame(&item, None, dst);
        Ok(())
    }
}
