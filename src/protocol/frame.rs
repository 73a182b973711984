//! Frame struct with typed accessors.
//!
//! Represents one protocol message: addressing, message id, flags,
//! optional timestamps and payload. Uses `bytes::Bytes` for the payload so
//! handlers can hand it on without copying.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use rtls_provider::protocol::{DeviceId, Frame, MessageId};
//!
//! let frame = Frame::command(DeviceId::BROADCAST, MessageId::GetVersion, Bytes::new());
//! let wire = frame.encode().unwrap();
//! assert!(wire.starts_with(b"@RTL"));
//! assert!(wire.ends_with(b"$END"));
//! ```

use bytes::Bytes;

use super::wire_format::{
    flags, DeviceId, MessageId, END_MARKER, HEADER_SIZE, MARKER_LEN, MAX_PAYLOAD_SIZE,
    MILLIS_TIMESTAMP_SIZE, PROTOCOL_DELIMITER, SECONDS_TIMESTAMP_SIZE, START_MARKER,
};
use crate::codec::HexCodec;
use crate::error::{Result, RtlsError};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol class byte.
    pub delimiter: u8,
    /// Anchor/tag this message concerns.
    pub device_id: DeviceId,
    /// Payload schema selector.
    pub message_id: MessageId,
    /// Host to device.
    pub outbound: bool,
    /// Sender expects a response.
    pub response_expected: bool,
    /// Device clock seconds, when present.
    pub seconds_timestamp: Option<u32>,
    /// Device clock milliseconds, when present.
    pub milliseconds_timestamp: Option<u16>,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a device-to-host frame without timestamps.
    pub fn new(device_id: DeviceId, message_id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            delimiter: PROTOCOL_DELIMITER,
            device_id,
            message_id,
            outbound: false,
            response_expected: false,
            seconds_timestamp: None,
            milliseconds_timestamp: None,
            payload: payload.into(),
        }
    }

    /// Create a host command expecting a response.
    pub fn command(device_id: DeviceId, message_id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            outbound: true,
            response_expected: true,
            ..Self::new(device_id, message_id, payload)
        }
    }

    /// Attach device timestamps.
    pub fn with_timestamps(mut self, seconds: Option<u32>, millis: Option<u16>) -> Self {
        self.seconds_timestamp = seconds;
        self.milliseconds_timestamp = millis;
        self
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Compose the flags byte.
    pub fn flags(&self) -> u8 {
        let mut f = 0;
        if self.outbound {
            f |= flags::OUTBOUND;
        }
        if self.response_expected {
            f |= flags::RESPONSE_EXPECTED;
        }
        if self.seconds_timestamp.is_some() {
            f |= flags::SECONDS_TIMESTAMP;
        }
        if self.milliseconds_timestamp.is_some() {
            f |= flags::MILLIS_TIMESTAMP;
        }
        f
    }

    /// Check if a seconds timestamp is carried.
    #[inline]
    pub fn includes_seconds_timestamp(&self) -> bool {
        self.seconds_timestamp.is_some()
    }

    /// Check if a milliseconds timestamp is carried.
    #[inline]
    pub fn includes_milliseconds_timestamp(&self) -> bool {
        self.milliseconds_timestamp.is_some()
    }

    /// Serialize the body (everything between the markers) as raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if the payload exceeds `MAX_PAYLOAD_SIZE`.
    pub fn body_bytes(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(RtlsError::InvalidParameter(format!(
                "{:?} payload of {} bytes exceeds {}",
                self.message_id,
                self.payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }
        let mut buf = Vec::with_capacity(
            HEADER_SIZE + SECONDS_TIMESTAMP_SIZE + MILLIS_TIMESTAMP_SIZE + self.payload.len(),
        );
        buf.push(self.delimiter);
        buf.push(self.flags());
        buf.extend_from_slice(self.device_id.as_bytes());
        buf.push(self.message_id.as_u8());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        if let Some(secs) = self.seconds_timestamp {
            buf.extend_from_slice(&secs.to_be_bytes());
        }
        if let Some(millis) = self.milliseconds_timestamp {
            buf.extend_from_slice(&millis.to_be_bytes());
        }
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Encode the complete wire unit: start marker, hex body, end marker.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = self.body_bytes()?;
        let mut out = Vec::with_capacity(MARKER_LEN * 2 + body.len() * 2);
        out.extend_from_slice(START_MARKER);
        HexCodec::encode_into(&body, &mut out);
        out.extend_from_slice(END_MARKER);
        Ok(out)
    }

    /// Decode the hex text found between the markers.
    pub fn decode_body(text: &[u8]) -> Result<Self> {
        let body = HexCodec::decode(text)?;
        Self::from_body_bytes(&body)
    }

    /// Decode a raw (already un-hexed) body.
    ///
    /// Every field is bounds-checked; a declared length that disagrees with
    /// the bytes actually present is rejected.
    pub fn from_body_bytes(body: &[u8]) -> Result<Self> {
        if body.len() < HEADER_SIZE {
            return Err(RtlsError::Decode(format!(
                "frame body too short: {} bytes",
                body.len()
            )));
        }

        let delimiter = body[0];
        if delimiter != PROTOCOL_DELIMITER {
            return Err(RtlsError::Decode(format!(
                "unsupported protocol delimiter 0x{:02X}",
                delimiter
            )));
        }

        let frame_flags = body[1];
        if frame_flags & flags::RESERVED_MASK != 0 {
            return Err(RtlsError::Decode(
                "reserved flag bits must be 0".to_string(),
            ));
        }

        let mut device = [0u8; 6];
        device.copy_from_slice(&body[2..8]);
        let message_id = MessageId::try_from(body[8])?;
        let declared = u16::from_be_bytes([body[9], body[10]]) as usize;
        if declared > MAX_PAYLOAD_SIZE {
            return Err(RtlsError::Decode(format!(
                "payload size {} exceeds maximum {}",
                declared, MAX_PAYLOAD_SIZE
            )));
        }

        let mut pos = HEADER_SIZE;
        let seconds_timestamp = if flags::has_flag(frame_flags, flags::SECONDS_TIMESTAMP) {
            let field = body
                .get(pos..pos + SECONDS_TIMESTAMP_SIZE)
                .ok_or_else(|| RtlsError::Decode("truncated seconds timestamp".to_string()))?;
            pos += SECONDS_TIMESTAMP_SIZE;
            Some(u32::from_be_bytes([field[0], field[1], field[2], field[3]]))
        } else {
            None
        };
        let milliseconds_timestamp = if flags::has_flag(frame_flags, flags::MILLIS_TIMESTAMP) {
            let field = body
                .get(pos..pos + MILLIS_TIMESTAMP_SIZE)
                .ok_or_else(|| {
                    RtlsError::Decode("truncated milliseconds timestamp".to_string())
                })?;
            pos += MILLIS_TIMESTAMP_SIZE;
            Some(u16::from_be_bytes([field[0], field[1]]))
        } else {
            None
        };

        let payload = &body[pos..];
        if payload.len() != declared {
            return Err(RtlsError::Decode(format!(
                "payload length mismatch: declared {}, found {}",
                declared,
                payload.len()
            )));
        }

        Ok(Self {
            delimiter,
            device_id: DeviceId(device),
            message_id,
            outbound: flags::has_flag(frame_flags, flags::OUTBOUND),
            response_expected: flags::has_flag(frame_flags, flags::RESPONSE_EXPECTED),
            seconds_timestamp,
            milliseconds_timestamp,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}
