//! Wire format constants and frame header fields.
//!
//! A frame travels as ASCII text:
//! ```text
//! ┌───────┬──────────────────────────────────────────────────────┬───────┐
//! │ @RTL  │ hex(body)                                            │ $END  │
//! └───────┴──────────────────────────────────────────────────────┴───────┘
//! ```
//!
//! The body, before hex encoding:
//! ```text
//! ┌───────┬───────┬───────────┬─────┬─────────┬──────────┬──────────┬─────────┐
//! │ Delim │ Flags │ Device ID │ MID │ Length  │ [Secs]   │ [Millis] │ Payload │
//! │ 1     │ 1     │ 6         │ 1   │ u16 BE  │ u32 BE   │ u16 BE   │ Length  │
//! └───────┴───────┴───────────┴─────┴─────────┴──────────┴──────────┴─────────┘
//! ```
//!
//! The timestamp fields are present only when the matching flag bit is set.
//! Neither marker can occur inside hex text, so the markers alone delimit
//! a frame; there is no checksum.

use std::fmt;

use crate::error::{Result, RtlsError};

/// Start-of-frame marker.
pub const START_MARKER: &[u8; 4] = b"@RTL";

/// End-of-frame marker.
pub const END_MARKER: &[u8; 4] = b"$END";

/// Marker length in characters.
pub const MARKER_LEN: usize = 4;

/// Protocol class byte carried at the start of every body.
pub const PROTOCOL_DELIMITER: u8 = 0xA5;

/// Fixed body header size in bytes (delimiter through length).
pub const HEADER_SIZE: usize = 11;

/// Seconds timestamp field size.
pub const SECONDS_TIMESTAMP_SIZE: usize = 4;

/// Milliseconds timestamp field size.
pub const MILLIS_TIMESTAMP_SIZE: usize = 2;

/// Largest payload the length field may declare.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Flag constants for the protocol.
pub mod flags {
    /// Direction: host to device (1) or device to host (0).
    pub const OUTBOUND: u8 = 0b0000_0001;
    /// Sender expects a response.
    pub const RESPONSE_EXPECTED: u8 = 0b0000_0010;
    /// A 4-byte seconds timestamp follows the length field.
    pub const SECONDS_TIMESTAMP: u8 = 0b0000_0100;
    /// A 2-byte milliseconds timestamp follows.
    pub const MILLIS_TIMESTAMP: u8 = 0b0000_1000;

    /// Reserved bits mask (bits 4-7).
    pub const RESERVED_MASK: u8 = 0b1111_0000;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }

    /// Host command flags: outbound + response expected.
    pub const COMMAND: u8 = OUTBOUND | RESPONSE_EXPECTED;
}

/// 6-byte anchor/tag address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceId(pub [u8; 6]);

impl DeviceId {
    /// Size of an address in bytes.
    pub const LEN: usize = 6;

    /// Number of addressable bits.
    pub const BITS: usize = 48;

    /// Address used before the anchor has identified itself.
    pub const BROADCAST: DeviceId = DeviceId([0xFF; 6]);

    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Bit `index` counted from the most significant bit of byte 0.
    #[inline]
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < Self::BITS);
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }
}

impl TryFrom<&[u8]> for DeviceId {
    type Error = RtlsError;

    fn try_from(value: &[u8]) -> Result<Self> {
        let bytes: [u8; 6] = value.try_into().map_err(|_| {
            RtlsError::InvalidParameter(format!(
                "device id must be {} bytes, got {}",
                Self::LEN,
                value.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Message identifiers.
///
/// Host requests use the low range; the device answers with the same value
/// plus [`MessageId::NOTIFY_BIT`]. Unsolicited notifications start at 0x90.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageId {
    GetVersion = 0x01,
    KeepAlive = 0x02,
    TagAnchorSearch = 0x03,
    AdhocBeacon = 0x04,
    UdControl = 0x05,
    LedControl = 0x06,
    StartFirmwareUpgrade = 0x07,
    EnterFirmwareUpgrade = 0x08,

    VersionNotify = 0x81,
    KeepAliveNotify = 0x82,
    TagAnchorSearchNotify = 0x83,
    AdhocBeaconNotify = 0x84,
    UdControlNotify = 0x85,
    LedControlNotify = 0x86,
    StartFirmwareUpgradeNotify = 0x87,
    EnterFirmwareUpgradeNotify = 0x88,

    PowerUpNotify = 0x90,
    DeviceStatusNotify = 0x91,
    TagPositionNotify = 0x92,
}

impl MessageId {
    /// Bit distinguishing a device notification from its request.
    pub const NOTIFY_BIT: u8 = 0x80;

    /// Wire value.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if this id is sent by the device.
    #[inline]
    pub fn is_notification(self) -> bool {
        self.as_u8() & Self::NOTIFY_BIT != 0
    }
}

impl TryFrom<u8> for MessageId {
    type Error = RtlsError;

    fn try_from(value: u8) -> Result<Self> {
        use MessageId::*;
        Ok(match value {
            0x01 => GetVersion,
            0x02 => KeepAlive,
            0x03 => TagAnchorSearch,
            0x04 => AdhocBeacon,
            0x05 => UdControl,
            0x06 => LedControl,
            0x07 => StartFirmwareUpgrade,
            0x08 => EnterFirmwareUpgrade,
            0x81 => VersionNotify,
            0x82 => KeepAliveNotify,
            0x83 => TagAnchorSearchNotify,
            0x84 => AdhocBeaconNotify,
            0x85 => UdControlNotify,
            0x86 => LedControlNotify,
            0x87 => StartFirmwareUpgradeNotify,
            0x88 => EnterFirmwareUpgradeNotify,
            0x90 => PowerUpNotify,
            0x91 => DeviceStatusNotify,
            0x92 => TagPositionNotify,
            other => {
                return Err(RtlsError::Decode(format!(
                    "unknown message id 0x{:02X}",
                    other
                )))
            }
        })
    }
}
