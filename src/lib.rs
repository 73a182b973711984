//! # rtls-provider
//!
//! Host-side protocol engine for RTLS anchors.
//!
//! An anchor talks to the host over a serial link using hex-encoded frames
//! wrapped in `@RTL` / `$END` markers. This crate decodes that stream,
//! tracks the anchor's state and drives tag searches, proximity tracking
//! and firmware upgrades on top of it.
//!
//! ## Architecture
//!
//! - **Framing** ([`protocol`]): marker scanning, hex text, binary header
//! - **Payloads** ([`codec`]): one typed schema per message id
//! - **Engine** ([`provider`]): device status machine and message handlers
//! - **I/O**: a read loop task and a batching writer task over any
//!   `AsyncRead`/`AsyncWrite` pair
//!
//! ## Example
//!
//! ```no_run
//! use rtls_provider::{OperationParams, ProviderBuilder, RtlsEvent};
//!
//! #[tokio::main]
//! async fn main() -> rtls_provider::Result<()> {
//!     let (host, _anchor) = rtls_provider::transport::loopback(4096);
//!     let (reader, writer) = tokio::io::split(host);
//!
//!     let (provider, mut events) = ProviderBuilder::new()
//!         .power_level(24)
//!         .start(reader, writer)
//!         .await?;
//!
//!     provider.start_operation(OperationParams::inventory()).await?;
//!     while let Some(event) = events.recv().await {
//!         if let RtlsEvent::TagFound(tag) = event {
//!             println!("tag {} rssi {}", tag.tag_id, tag.rssi);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod codec;
pub mod error;
pub mod event;
pub mod filter;
pub mod protocol;
pub mod provider;
pub mod ring_buffer;
pub mod transport;

mod writer;

pub use catalog::{ErrorCatalog, ErrorCodeEntry};
pub use error::{Result, ResultCode, RtlsError};
pub use event::{FirmwareOutcome, FirmwareProgress, RtlsEvent, TagProximity};
pub use filter::{MovingAverage, ProximityReport, RollingMinimum};
pub use protocol::{DeviceId, Frame, MessageId};
pub use provider::{
    DeviceStatus, OperationParams, Provider, ProviderBuilder, ProviderConfig, SelectMask,
};
pub use ring_buffer::RingBuffer;
