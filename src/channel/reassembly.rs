//! Reassembly of frames from a TCP byte stream
//!
//! A receive can end anywhere: mid-frame, on a boundary, or several frames
//! in. Bytes that do not yet form a whole frame stay buffered until the next
//! receive. Nothing bounds the buffer besides the frame size limit a
//! well-behaved peer respects; a peer that never completes a frame makes it
//! grow without limit.

use bytes::BytesMut;

use crate::protocol::{decode_frame, CodecResult, WireFrame};

/// Per-channel accumulator bridging stream and frame boundaries
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: BytesMut,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes and decode every frame now complete, in order.
    ///
    /// A malformed frame yields an error entry and decoding continues with
    /// the frame after it.
    pub fn feed<F: WireFrame>(&mut self, bytes: &[u8]) -> Vec<CodecResult<F>> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        loop {
            match decode_frame(&mut self.buffer) {
                Ok(Some(frame)) => frames.push(Ok(frame)),
                Ok(None) => break,
                Err(e) => frames.push(Err(e)),
            }
        }
        frames
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
