//! Codec module - text and payload encoding.
//!
//! This module provides the two encoding layers below a frame:
//!
//! - [`HexCodec`] - uppercase hexadecimal text used between the frame markers
//! - [`Payload`] - typed binary payload schemas, one per message id
//!
//! # Design
//!
//! Codecs are plain structs and traits with static dispatch; the message id
//! of every schema is an associated constant, so a handler never matches a
//! payload against the wrong frame by accident.
//!
//! # Example
//!
//! ```
//! use rtls_provider::codec::{HexCodec, KeepAliveInfo, Payload};
//!
//! let info = KeepAliveInfo { uptime_seconds: 60, battery_percent: 87 };
//! let text = HexCodec::encode(&info.encode());
//! assert_eq!(text, b"0000003C57");
//!
//! let raw = HexCodec::decode(&text).unwrap();
//! assert_eq!(KeepAliveInfo::decode(&raw).unwrap(), info);
//! ```

mod hex;
mod payload;

pub use hex::HexCodec;
pub use payload::{
    search_options, AdhocBeaconRequest, AdhocBeaconResult, BlockAck, BlockWrite,
    DeviceStatusReport, EnterUpgradeAck, EnterUpgradeRequest, ErrorCode, KeepAliveInfo,
    LedControlRequest, LedControlResult, Payload, PowerUpInfo, SearchMode, SearchRequest,
    TagPosition, TagSearchResult, UdControlRequest, UdControlResult, Version, VersionInfo,
};
