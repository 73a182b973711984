//! Byte transports the provider can run on.
//!
//! The provider only needs an `AsyncRead` half and an `AsyncWrite` half.
//! This module supplies the two used in practice:
//! - an in-memory loopback pair, for tests and simulated anchors
//! - a serial port (`serial` feature)

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::{open_serial, DEFAULT_BAUD_RATE};

use tokio::io::DuplexStream;

/// Default loopback buffer size in bytes.
pub const DEFAULT_LOOPBACK_CAPACITY: usize = 8 * 1024;

/// Create a connected in-memory transport pair.
///
/// Bytes written to one end are read from the other. The first stream is
/// meant for the provider, the second for whatever plays the anchor.
pub fn loopback(capacity: usize) -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(capacity.max(1))
}
