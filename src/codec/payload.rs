//! Payload codec - typed payload schemas keyed by message id.
//!
//! Every message id has a fixed binary payload layout (big-endian
//! integers). Each schema implements [`Payload`], which ties it to its
//! [`MessageId`] and provides bounds-checked decoding: a short payload is a
//! `Decode` error, never a panic.
//!
//! # Example
//!
//! ```
//! use rtls_provider::codec::{LedControlRequest, Payload};
//! use rtls_provider::protocol::DeviceId;
//!
//! let request = LedControlRequest { target: DeviceId::new([1, 2, 3, 4, 5, 6]), times: 3 };
//! let bytes = request.encode();
//! assert_eq!(bytes.len(), 7);
//! assert_eq!(LedControlRequest::decode(&bytes).unwrap(), request);
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, RtlsError};
use crate::protocol::{DeviceId, MessageId};

/// In-band status code carried by device responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError,
    /// No tag answered the search.
    NoResponse,
    /// The inventory session timed out on the device.
    InventoryTimeout,
    ChecksumMismatch,
    WriteFlashNotBlank,
    WriteFlashFailed,
    /// Firmware info block written; upgrade complete.
    WriteInfoOk,
    /// Image accepted; the device must reset into its bootloader.
    ChecksumOkResetRequired,
    /// The device is already running its bootloader.
    InBootloader,
    InvalidParameter,
    DeviceBusy,
    Other(u8),
}

impl ErrorCode {
    /// Wire value.
    pub fn as_u8(self) -> u8 {
        match self {
            ErrorCode::NoError => 0x00,
            ErrorCode::NoResponse => 0x01,
            ErrorCode::InventoryTimeout => 0x02,
            ErrorCode::ChecksumMismatch => 0x03,
            ErrorCode::WriteFlashNotBlank => 0x04,
            ErrorCode::WriteFlashFailed => 0x05,
            ErrorCode::WriteInfoOk => 0x06,
            ErrorCode::ChecksumOkResetRequired => 0x07,
            ErrorCode::InBootloader => 0x08,
            ErrorCode::InvalidParameter => 0x09,
            ErrorCode::DeviceBusy => 0x0A,
            ErrorCode::Other(v) => v,
        }
    }

    /// Check if this code means "no tag answered" in any form.
    #[inline]
    pub fn is_no_response(self) -> bool {
        matches!(self, ErrorCode::NoResponse | ErrorCode::InventoryTimeout)
    }
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => ErrorCode::NoError,
            0x01 => ErrorCode::NoResponse,
            0x02 => ErrorCode::InventoryTimeout,
            0x03 => ErrorCode::ChecksumMismatch,
            0x04 => ErrorCode::WriteFlashNotBlank,
            0x05 => ErrorCode::WriteFlashFailed,
            0x06 => ErrorCode::WriteInfoOk,
            0x07 => ErrorCode::ChecksumOkResetRequired,
            0x08 => ErrorCode::InBootloader,
            0x09 => ErrorCode::InvalidParameter,
            0x0A => ErrorCode::DeviceBusy,
            other => ErrorCode::Other(other),
        }
    }
}

/// A typed payload bound to one message id.
pub trait Payload: Sized {
    /// Message id carrying this payload.
    const MESSAGE_ID: MessageId;

    /// Append the payload bytes to `out`.
    fn encode_into(&self, out: &mut BytesMut);

    /// Parse the payload of a frame.
    fn decode(data: &[u8]) -> Result<Self>;

    /// Encode into a fresh buffer.
    fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode_into(&mut out);
        out.freeze()
    }
}

/// Bounds-checked cursor over a payload.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    schema: &'static str,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], schema: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            schema,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let field = self.data.get(self.pos..self.pos + n).ok_or_else(|| {
            RtlsError::Decode(format!(
                "{} payload truncated: need {} bytes at offset {}, have {}",
                self.schema,
                n,
                self.pos,
                self.data.len()
            ))
        })?;
        self.pos += n;
        Ok(field)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn i8(&mut self) -> Result<i8> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16> {
        Ok(self.u16()? as i16)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn array4(&mut self) -> Result<[u8; 4]> {
        let b = self.take(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }

    fn device_id(&mut self) -> Result<DeviceId> {
        DeviceId::try_from(self.take(DeviceId::LEN)?)
    }

    fn error_code(&mut self) -> Result<ErrorCode> {
        Ok(ErrorCode::from(self.u8()?))
    }

    fn rest(&mut self) -> Bytes {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        Bytes::copy_from_slice(rest)
    }
}

/// Four-part firmware version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version(pub [u8; 4]);

impl Version {
    /// Check for the all-zero sentinel reported by the bootloader.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 4]
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = &self.0;
        write!(f, "{}.{}.{}.{}", v[0], v[1], v[2], v[3])
    }
}

/// `VersionNotify` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    /// Application firmware version; `0.0.0.0` while in the bootloader.
    pub application: Version,
    pub bootloader: Version,
}

impl VersionInfo {
    /// Check if the device is running its bootloader.
    #[inline]
    pub fn is_bootloader(&self) -> bool {
        self.application.is_zero()
    }
}

impl Payload for VersionInfo {
    const MESSAGE_ID: MessageId = MessageId::VersionNotify;

    fn encode_into(&self, out: &mut BytesMut) {
        out.put_slice(&self.application.0);
        out.put_slice(&self.bootloader.0);
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, "version");
        Ok(Self {
            application: Version(r.array4()?),
            bootloader: Version(r.array4()?),
        })
    }
}

/// `PowerUpNotify` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerUpInfo {
    pub reset_cause: u8,
}

impl Payload for PowerUpInfo {
    const MESSAGE_ID: MessageId = MessageId::PowerUpNotify;

    fn encode_into(&self, out: &mut BytesMut) {
        out.put_u8(self.reset_cause);
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, "power-up");
        Ok(Self {
            reset_cause: r.u8()?,
        })
    }
}

/// `KeepAliveNotify` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveInfo {
    pub uptime_seconds: u32,
    pub battery_percent: u8,
}

impl Payload for KeepAliveInfo {
    const MESSAGE_ID: MessageId = MessageId::KeepAliveNotify;

    fn encode_into(&self, out: &mut BytesMut) {
        out.put_u32(self.uptime_seconds);
        out.put_u8(self.battery_percent);
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, "keep-alive");
        Ok(Self {
            uptime_seconds: r.u32()?,
            battery_percent: r.u8()?,
        })
    }
}

/// Search behaviour requested from the anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SearchMode {
    Inventory = 0,
    Ranging = 1,
    Searching = 2,
    Read = 3,
}

impl TryFrom<u8> for SearchMode {
    type Error = RtlsError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SearchMode::Inventory),
            1 => Ok(SearchMode::Ranging),
            2 => Ok(SearchMode::Searching),
            3 => Ok(SearchMode::Read),
            other => Err(RtlsError::Decode(format!("unknown search mode {}", other))),
        }
    }
}

/// Option bits of a search request.
pub mod search_options {
    /// Flip the inventory session so every tag answers again.
    pub const TOGGLE_SESSION: u8 = 0b0000_0001;
    /// Blink the tag LED when it is read.
    pub const LED_BLINK: u8 = 0b0000_0010;
    /// Only the tag matching the mask may answer.
    pub const SINGLE_TAG: u8 = 0b0000_0100;
}

/// `TagAnchorSearch` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchRequest {
    /// Correlation token echoed in the result.
    pub search_index: u8,
    pub mode: SearchMode,
    /// See [`search_options`].
    pub options: u8,
    pub power_level: u8,
    pub back_off: u8,
    /// All zeros for an open search.
    pub tag_mask: DeviceId,
}

impl Payload for SearchRequest {
    const MESSAGE_ID: MessageId = MessageId::TagAnchorSearch;

    fn encode_into(&self, out: &mut BytesMut) {
        out.put_u8(self.search_index);
        out.put_u8(self.mode as u8);
        out.put_u8(self.options);
        out.put_u8(self.power_level);
        out.put_u8(self.back_off);
        out.put_slice(self.tag_mask.as_bytes());
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, "search request");
        Ok(Self {
            search_index: r.u8()?,
            mode: SearchMode::try_from(r.u8()?)?,
            options: r.u8()?,
            power_level: r.u8()?,
            back_off: r.u8()?,
            tag_mask: r.device_id()?,
        })
    }
}

/// `TagAnchorSearchNotify` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSearchResult {
    pub search_index: u8,
    pub error: ErrorCode,
    pub tag_id: DeviceId,
    /// dBm.
    pub rssi: i16,
    pub distance_cm: u16,
    /// Tag user data (Read operations).
    pub data: Bytes,
}

impl Payload for TagSearchResult {
    const MESSAGE_ID: MessageId = MessageId::TagAnchorSearchNotify;

    fn encode_into(&self, out: &mut BytesMut) {
        out.put_u8(self.search_index);
        out.put_u8(self.error.as_u8());
        out.put_slice(self.tag_id.as_bytes());
        out.put_i16(self.rssi);
        out.put_u16(self.distance_cm);
        out.put_slice(&self.data);
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, "search result");
        Ok(Self {
            search_index: r.u8()?,
            error: r.error_code()?,
            tag_id: r.device_id()?,
            rssi: r.i16()?,
            distance_cm: r.u16()?,
            data: r.rest(),
        })
    }
}

/// `AdhocBeacon` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdhocBeaconRequest {
    pub target: DeviceId,
    pub count: u8,
    pub interval_ms: u16,
}

impl Payload for AdhocBeaconRequest {
    const MESSAGE_ID: MessageId = MessageId::AdhocBeacon;

    fn encode_into(&self, out: &mut BytesMut) {
        out.put_slice(self.target.as_bytes());
        out.put_u8(self.count);
        out.put_u16(self.interval_ms);
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, "ad-hoc beacon request");
        Ok(Self {
            target: r.device_id()?,
            count: r.u8()?,
            interval_ms: r.u16()?,
        })
    }
}

/// `AdhocBeaconNotify` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdhocBeaconResult {
    pub error: ErrorCode,
    pub anchor_id: DeviceId,
    pub rssi: i16,
    pub distance_cm: u16,
}

impl Payload for AdhocBeaconResult {
    const MESSAGE_ID: MessageId = MessageId::AdhocBeaconNotify;

    fn encode_into(&self, out: &mut BytesMut) {
        out.put_u8(self.error.as_u8());
        out.put_slice(self.anchor_id.as_bytes());
        out.put_i16(self.rssi);
        out.put_u16(self.distance_cm);
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, "ad-hoc beacon result");
        Ok(Self {
            error: r.error_code()?,
            anchor_id: r.device_id()?,
            rssi: r.i16()?,
            distance_cm: r.u16()?,
        })
    }
}

/// `LedControl` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedControlRequest {
    pub target: DeviceId,
    pub times: u8,
}

impl Payload for LedControlRequest {
    const MESSAGE_ID: MessageId = MessageId::LedControl;

    fn encode_into(&self, out: &mut BytesMut) {
        out.put_slice(self.target.as_bytes());
        out.put_u8(self.times);
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, "LED request");
        Ok(Self {
            target: r.device_id()?,
            times: r.u8()?,
        })
    }
}

/// `LedControlNotify` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedControlResult {
    pub error: ErrorCode,
    pub target: DeviceId,
}

impl Payload for LedControlResult {
    const MESSAGE_ID: MessageId = MessageId::LedControlNotify;

    fn encode_into(&self, out: &mut BytesMut) {
        out.put_u8(self.error.as_u8());
        out.put_slice(self.target.as_bytes());
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, "LED result");
        Ok(Self {
            error: r.error_code()?,
            target: r.device_id()?,
        })
    }
}

/// `UdControl` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdControlRequest {
    pub flags: u8,
}

impl Payload for UdControlRequest {
    const MESSAGE_ID: MessageId = MessageId::UdControl;

    fn encode_into(&self, out: &mut BytesMut) {
        out.put_u8(self.flags);
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, "user-data request");
        Ok(Self { flags: r.u8()? })
    }
}

/// `UdControlNotify` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdControlResult {
    pub error: ErrorCode,
    pub flags: u8,
    pub data: Bytes,
}

impl Payload for UdControlResult {
    const MESSAGE_ID: MessageId = MessageId::UdControlNotify;

    fn encode_into(&self, out: &mut BytesMut) {
        out.put_u8(self.error.as_u8());
        out.put_u8(self.flags);
        out.put_slice(&self.data);
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, "user-data result");
        Ok(Self {
            error: r.error_code()?,
            flags: r.u8()?,
            data: r.rest(),
        })
    }
}

/// `EnterFirmwareUpgrade` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnterUpgradeRequest {
    pub total_blocks: u16,
    pub image_length: u32,
}

impl Payload for EnterUpgradeRequest {
    const MESSAGE_ID: MessageId = MessageId::EnterFirmwareUpgrade;

    fn encode_into(&self, out: &mut BytesMut) {
        out.put_u16(self.total_blocks);
        out.put_u32(self.image_length);
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, "enter upgrade request");
        Ok(Self {
            total_blocks: r.u16()?,
            image_length: r.u32()?,
        })
    }
}

/// `EnterFirmwareUpgradeNotify` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnterUpgradeAck {
    pub error: ErrorCode,
}

impl Payload for EnterUpgradeAck {
    const MESSAGE_ID: MessageId = MessageId::EnterFirmwareUpgradeNotify;

    fn encode_into(&self, out: &mut BytesMut) {
        out.put_u8(self.error.as_u8());
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, "enter upgrade ack");
        Ok(Self {
            error: r.error_code()?,
        })
    }
}

/// `StartFirmwareUpgrade` payload: one image block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWrite {
    pub block_index: u16,
    pub total_blocks: u16,
    /// Exactly one block of image data, padded.
    pub data: Bytes,
}

impl Payload for BlockWrite {
    const MESSAGE_ID: MessageId = MessageId::StartFirmwareUpgrade;

    fn encode_into(&self, out: &mut BytesMut) {
        out.put_u16(self.block_index);
        out.put_u16(self.total_blocks);
        out.put_slice(&self.data);
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, "block write");
        Ok(Self {
            block_index: r.u16()?,
            total_blocks: r.u16()?,
            data: r.rest(),
        })
    }
}

/// `StartFirmwareUpgradeNotify` payload: per-block acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAck {
    pub error: ErrorCode,
    pub block_index: u16,
}

impl Payload for BlockAck {
    const MESSAGE_ID: MessageId = MessageId::StartFirmwareUpgradeNotify;

    fn encode_into(&self, out: &mut BytesMut) {
        out.put_u8(self.error.as_u8());
        out.put_u16(self.block_index);
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, "block ack");
        Ok(Self {
            error: r.error_code()?,
            block_index: r.u16()?,
        })
    }
}

/// `DeviceStatusNotify` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatusReport {
    /// Device-side state code.
    pub state: u8,
    pub temperature_c: i8,
    pub battery_percent: u8,
}

impl Payload for DeviceStatusReport {
    const MESSAGE_ID: MessageId = MessageId::DeviceStatusNotify;

    fn encode_into(&self, out: &mut BytesMut) {
        out.put_u8(self.state);
        out.put_i8(self.temperature_c);
        out.put_u8(self.battery_percent);
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, "device status");
        Ok(Self {
            state: r.u8()?,
            temperature_c: r.i8()?,
            battery_percent: r.u8()?,
        })
    }
}

/// `TagPositionNotify` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagPosition {
    pub tag_id: DeviceId,
    pub x_cm: i32,
    pub y_cm: i32,
    pub z_cm: i32,
}

impl Payload for TagPosition {
    const MESSAGE_ID: MessageId = MessageId::TagPositionNotify;

    fn encode_into(&self, out: &mut BytesMut) {
        out.put_slice(self.tag_id.as_bytes());
        out.put_i32(self.x_cm);
        out.put_i32(self.y_cm);
        out.put_i32(self.z_cm);
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data, "tag position");
        Ok(Self {
            tag_id: r.device_id()?,
            x_cm: r.i32()?,
            y_cm: r.i32()?,
            z_cm: r.i32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAG: DeviceId = DeviceId::new([0xE2, 0x00, 0x00, 0x17, 0x22, 0x09]);

    #[test]
    fn test_error_code_wire_values() {
        for raw in 0u8..=0x0A {
            assert_eq!(ErrorCode::from(raw).as_u8(), raw);
        }
        assert_eq!(ErrorCode::from(0x42), ErrorCode::Other(0x42));
        assert!(ErrorCode::InventoryTimeout.is_no_response());
        assert!(!ErrorCode::ChecksumMismatch.is_no_response());
    }

    #[test]
    fn test_version_sentinel() {
        let info = VersionInfo::decode(&[0, 0, 0, 0, 1, 2, 0, 0]).unwrap();
        assert!(info.is_bootloader());
        assert_eq!(info.bootloader.to_string(), "1.2.0.0");

        let info = VersionInfo::decode(&[2, 1, 0, 7, 1, 0, 0, 0]).unwrap();
        assert!(!info.is_bootloader());
    }

    #[test]
    fn test_version_truncated() {
        let err = VersionInfo::decode(&[1, 2, 3]).unwrap_err();
        assert!(err.to_string().contains("version payload truncated"));
    }

    #[test]
    fn test_search_request_layout() {
        let request = SearchRequest {
            search_index: 0x11,
            mode: SearchMode::Searching,
            options: search_options::SINGLE_TAG | search_options::LED_BLINK,
            power_level: 20,
            back_off: 3,
            tag_mask: TAG,
        };
        let bytes = request.encode();
        assert_eq!(&bytes[..5], &[0x11, 2, 0x06, 20, 3]);
        assert_eq!(&bytes[5..], TAG.as_bytes());
        assert_eq!(SearchRequest::decode(&bytes).unwrap(), request);
    }

    #[test]
    fn test_search_result_with_user_data() {
        let result = TagSearchResult {
            search_index: 9,
            error: ErrorCode::NoError,
            tag_id: TAG,
            rssi: -61,
            distance_cm: 250,
            data: Bytes::from_static(b"\xCA\xFE"),
        };
        let decoded = TagSearchResult::decode(&result.encode()).unwrap();
        assert_eq!(decoded.rssi, -61);
        assert_eq!(decoded.data, Bytes::from_static(b"\xCA\xFE"));
    }

    #[test]
    fn test_search_result_truncated_tag_id() {
        let err = TagSearchResult::decode(&[1, 0, 0xE2, 0x00]).unwrap_err();
        assert!(matches!(err, RtlsError::Decode(_)));
    }

    #[test]
    fn test_unknown_search_mode() {
        let mut bytes = BytesMut::new();
        bytes.put_slice(&[1, 9, 0, 0, 0]);
        bytes.put_slice(TAG.as_bytes());
        assert!(SearchRequest::decode(&bytes).is_err());
    }

    #[test]
    fn test_negative_position_fields() {
        let position = TagPosition {
            tag_id: TAG,
            x_cm: -120,
            y_cm: 0,
            z_cm: 35_000,
        };
        assert_eq!(TagPosition::decode(&position.encode()).unwrap(), position);
    }

    #[test]
    fn test_block_write_size() {
        let block = BlockWrite {
            block_index: 3,
            total_blocks: 10,
            data: Bytes::from(vec![0xFF; 64]),
        };
        assert_eq!(block.encode().len(), 68);
    }

    #[test]
    fn test_message_ids() {
        assert_eq!(BlockAck::MESSAGE_ID, MessageId::StartFirmwareUpgradeNotify);
        assert_eq!(SearchRequest::MESSAGE_ID, MessageId::TagAnchorSearch);
        assert!(TagSearchResult::MESSAGE_ID.is_notification());
    }
}
