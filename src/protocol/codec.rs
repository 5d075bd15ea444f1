//! Frame codec
//!
//! Handles the length-prefixed framing shared by control commands and data
//! messages. A frame is `[length][discriminator][payload]` where `length`
//! counts the whole frame, so a frame never exceeds 255 bytes.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Largest frame the one-byte length prefix can describe
pub const MAX_FRAME_LEN: usize = u8::MAX as usize;

/// Header size: length(1) + discriminator(1) = 2 bytes
pub const FRAME_HEADER_LEN: usize = 2;

/// Largest payload a single frame can carry
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - FRAME_HEADER_LEN;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame length byte: {0}")]
    InvalidLength(u8),

    #[error("Unknown discriminator: {0:#04x}")]
    UnknownDiscriminator(u8),

    #[error("Malformed {kind} payload: expected {expected} bytes, got {actual}")]
    PayloadSize {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid {0} value in payload: {1}")]
    InvalidValue(&'static str, u8),

    #[error("Text is not valid UTF-8")]
    InvalidText,

    #[error("Text too long: {0} bytes (max: {1})")]
    TextTooLong(usize, usize),

    #[error("Unexpected text continuation frame")]
    UnexpectedContinuation,

    #[error("Datagram carries {0} bytes beyond its frame")]
    TrailingBytes(usize),

    #[error("Configuration encoding error: {0}")]
    Configuration(String),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// A value that occupies exactly one frame on the wire.
pub trait WireFrame: Sized {
    /// The discriminator byte following the length prefix
    fn discriminator(&self) -> u8;

    /// Append the type-specific payload
    fn encode_payload(&self, buf: &mut BytesMut) -> CodecResult<()>;

    /// Rebuild a value from its discriminator and complete payload
    fn decode_payload(discriminator: u8, payload: &[u8]) -> CodecResult<Self>;
}

/// Encode one frame into `buf`, returning the number of bytes written.
///
/// On failure nothing is left behind in `buf`.
pub fn encode_frame<F: WireFrame>(frame: &F, buf: &mut BytesMut) -> CodecResult<usize> {
    let start = buf.len();
    buf.put_u8(0);
    buf.put_u8(frame.discriminator());

    if let Err(e) = frame.encode_payload(buf) {
        buf.truncate(start);
        return Err(e);
    }

    let length = buf.len() - start;
    if length > MAX_FRAME_LEN {
        buf.truncate(start);
        return Err(CodecError::FrameTooLarge(length, MAX_FRAME_LEN));
    }

    buf[start] = length as u8;
    Ok(length)
}

/// Attempt to decode one frame from the start of `buf`.
///
/// Returns `Ok(None)` if more bytes are needed; the buffer is left untouched
/// in that case. Once a frame is complete its bytes are consumed even if the
/// payload turns out to be malformed, so the next call starts on the
/// following frame.
pub fn decode_frame<F: WireFrame>(buf: &mut BytesMut) -> CodecResult<Option<F>> {
    let Some(&length) = buf.first() else {
        return Ok(None);
    };

    if (length as usize) < FRAME_HEADER_LEN {
        buf.advance(1);
        return Err(CodecError::InvalidLength(length));
    }

    let length = length as usize;
    if buf.len() < length {
        return Ok(None);
    }

    let frame = buf.split_to(length);
    F::decode_payload(frame[1], &frame[FRAME_HEADER_LEN..]).map(Some)
}

/// Decode a buffer that must hold exactly one frame, as a UDP datagram does.
pub fn decode_exact<F: WireFrame>(datagram: &[u8]) -> CodecResult<F> {
    let mut buf = BytesMut::from(datagram);
    match decode_frame(&mut buf)? {
        Some(frame) if buf.is_empty() => Ok(frame),
        Some(_) => Err(CodecError::TrailingBytes(buf.len())),
        None => Err(CodecError::PayloadSize {
            kind: "datagram",
            expected: datagram.first().copied().unwrap_or(0) as usize,
            actual: datagram.len(),
        }),
    }
}

/// Check that a fixed-size payload has the expected length
pub(crate) fn expect_len(kind: &'static str, payload: &[u8], expected: usize) -> CodecResult<()> {
    if payload.len() != expected {
        return Err(CodecError::PayloadSize {
            kind,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

/// Read `N` big-endian floats from a payload already checked by `expect_len`
pub(crate) fn read_f32s<const N: usize>(mut payload: &[u8]) -> [f32; N] {
    let mut values = [0.0; N];
    for value in values.iter_mut() {
        *value = payload.get_f32();
    }
    values
}
