//! Serial port transport.

use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::error::Result;

/// Baud rate anchors ship with.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Open a serial port at 8N1 without flow control.
///
/// # Errors
///
/// Returns `Io` if the port cannot be opened.
pub fn open_serial(path: &str, baud_rate: u32) -> Result<SerialStream> {
    let port = tokio_serial::new(path, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(std::io::Error::from)?;

    tracing::info!(path, baud_rate, "Serial port opened");
    Ok(port)
}
