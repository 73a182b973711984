//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` as a growing text accumulator. Each push appends
//! the newly received bytes and then drains every complete frame:
//!
//! 1. locate the first end marker; without one, wait for more bytes;
//! 2. an end marker with no start marker before it is a stray left by a
//!    corrupted frame: drop everything through it and scan again;
//! 3. when several start markers precede the end marker, the last one
//!    opens the frame and the truncated fragment before it is dropped;
//! 4. decode the text between the markers, drop the consumed prefix and
//!    loop.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use rtls_provider::protocol::{DeviceId, Frame, FrameBuffer, MessageId};
//!
//! let mut buffer = FrameBuffer::new();
//! let wire = Frame::new(DeviceId::BROADCAST, MessageId::PowerUpNotify, Bytes::new()).encode().unwrap();
//!
//! let (head, tail) = wire.split_at(7);
//! assert!(buffer.push(head).is_empty());
//! let frames = buffer.push(tail);
//! assert_eq!(frames.len(), 1);
//! assert!(frames[0].is_ok());
//! ```

use bytes::{Buf, BytesMut};

use super::wire_format::{END_MARKER, HEADER_SIZE, MARKER_LEN, MAX_PAYLOAD_SIZE, START_MARKER};
use super::Frame;
use crate::error::Result;

/// Default cap on buffered text that contains no complete frame.
pub const DEFAULT_MAX_BUFFERED: usize = 64 * 1024;

/// Longest possible wire frame, markers included.
pub const MAX_FRAME_TEXT: usize = MARKER_LEN * 2 + (HEADER_SIZE + 6 + MAX_PAYLOAD_SIZE) * 2;

/// Buffer for accumulating incoming text and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from transport reads.
    buffer: BytesMut,
    /// Cap on pending bytes before garbage is discarded.
    max_buffered: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    pub fn new() -> Self {
        Self::with_max_buffered(DEFAULT_MAX_BUFFERED)
    }

    /// Create a new frame buffer with a custom pending-text cap.
    ///
    /// The cap is raised to [`MAX_FRAME_TEXT`] if smaller, so a single
    /// legal frame always fits.
    pub fn with_max_buffered(max_buffered: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
            max_buffered: max_buffered.max(MAX_FRAME_TEXT),
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns one entry per delimited frame found, in arrival order. A
    /// frame whose text fails to decode yields an `Err` entry; it is
    /// consumed like any other and does not block the frames behind it.
    pub fn push(&mut self, data: &[u8]) -> Vec<Result<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one() {
            frames.push(frame);
        }

        self.enforce_limit();
        frames
    }

    /// Try to extract a single frame from the buffer.
    ///
    /// Returns `None` when no complete frame is buffered.
    fn try_extract_one(&mut self) -> Option<Result<Frame>> {
        loop {
            let end = find(&self.buffer, END_MARKER)?;

            match rfind(&self.buffer[..end], START_MARKER) {
                None => {
                    tracing::debug!(
                        discarded = end + MARKER_LEN,
                        "Discarding text through stray end marker"
                    );
                    self.buffer.advance(end + MARKER_LEN);
                }
                Some(start) => {
                    if start > 0 {
                        tracing::debug!(discarded = start, "Discarding text before start marker");
                    }
                    let result = Frame::decode_body(&self.buffer[start + MARKER_LEN..end]);
                    self.buffer.advance(end + MARKER_LEN);
                    return Some(result);
                }
            }
        }
    }

    /// Drop text that can never become part of a frame.
    fn enforce_limit(&mut self) {
        if self.buffer.len() <= self.max_buffered {
            return;
        }

        match rfind(&self.buffer, START_MARKER) {
            Some(start) if self.buffer.len() - start <= MAX_FRAME_TEXT => {
                tracing::warn!(discarded = start, "Frame buffer over limit, keeping last partial frame");
                self.buffer.advance(start);
            }
            _ => {
                tracing::warn!(discarded = self.buffer.len(), "Frame buffer over limit, clearing");
                self.buffer.clear();
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn find(haystack: &[u8], marker: &[u8; MARKER_LEN]) -> Option<usize> {
    haystack.windows(MARKER_LEN).position(|w| w == marker)
}

fn rfind(haystack: &[u8], marker: &[u8; MARKER_LEN]) -> Option<usize> {
    haystack.windows(MARKER_LEN).rposition(|w| w == marker)
}
