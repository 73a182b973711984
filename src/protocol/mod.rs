//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the textual frame protocol spoken by the anchor:
//! - marker-delimited hex text encoding/decoding
//! - frame buffer for accumulating partial reads and resynchronizing
//! - Frame struct with typed accessors

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::Frame;
pub use frame_buffer::{FrameBuffer, DEFAULT_MAX_BUFFERED, MAX_FRAME_TEXT};
pub use wire_format::{
    flags, DeviceId, MessageId, END_MARKER, HEADER_SIZE, MARKER_LEN, MAX_PAYLOAD_SIZE,
    PROTOCOL_DELIMITER, START_MARKER,
};
