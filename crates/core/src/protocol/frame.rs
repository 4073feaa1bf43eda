//! Length-prefixed framing for the device socket
//!
//! The wire format is repeated frames of:
//! - 4 bytes: payload length (big endian, unsigned)
//! - N bytes: UTF-8 JSON payload
//!
//! No padding, no checksum.

use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// Frame a payload for the device socket
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        size: payload.len(),
    })?;

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u32(len);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Accumulates bytes from the device socket and yields complete frames
///
/// Consumed bytes are released by advancing the underlying `BytesMut` cursor,
/// so draining a stream of frames never copies the unread tail.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(u32::MAX as usize)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    /// Append bytes received from the socket
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Direct access for `AsyncReadExt::read_buf`
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Number of bytes waiting for a complete frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Take the next complete frame, if one is buffered
    ///
    /// Returns `Ok(None)` when fewer than 4 bytes, or fewer payload bytes than
    /// announced, are available. An oversized length prefix is an error since
    /// the stream cannot be resynchronized after it.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let size = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge { size }.into());
        }

        if self.buffer.len() - FRAME_HEADER_LEN < size {
            // Not enough data yet
            self.buffer.reserve(FRAME_HEADER_LEN + size - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(FRAME_HEADER_LEN);
        Ok(Some(self.buffer.split_to(size).freeze()))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Interpret a frame payload as UTF-8 text
pub fn frame_text(frame: &[u8]) -> Result<&str> {
    std::str::from_utf8(frame).map_err(|_| ProtocolError::InvalidUtf8.into())
}
