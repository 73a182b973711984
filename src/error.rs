//! Error types for rtls-provider.

use thiserror::Error;

use crate::provider::DeviceStatus;

/// Main error type for all provider operations.
#[derive(Debug, Error)]
pub enum RtlsError {
    /// I/O error on the transport or while reading a firmware image.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration or the error catalog.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed frame text or payload.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The transport is not open or the provider was shut down.
    #[error("Transport not initialized")]
    NotInitialized,

    /// The device is not in a state that accepts the command.
    #[error("Device not ready (status: {0})")]
    DeviceNotReady(DeviceStatus),

    /// An operation is already running on the device.
    #[error("Radio busy (status: {0})")]
    RadioBusy(DeviceStatus),

    /// Malformed command parameters.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Sending a command failed.
    #[error("Command failed: {0}")]
    Failure(String),

    /// The ring buffer was closed.
    #[error("Buffer closed")]
    BufferClosed,

    /// Outbound channel closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias using RtlsError.
pub type Result<T> = std::result::Result<T, RtlsError>;

/// Flat status code for callers that report results numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResultCode {
    Ok = 0,
    Failure = 1,
    InvalidParameter = 2,
    NotInitialized = 3,
    NotSupported = 4,
    OperationCancelled = 5,
    OutOfMemory = 6,
    RadioBusy = 7,
    DeviceNotReady = 8,
    AlreadyOpen = 9,
}

impl ResultCode {
    /// Map a provider result to its status code.
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => ResultCode::Ok,
            Err(e) => e.code(),
        }
    }
}

impl RtlsError {
    /// Status code for this error.
    pub fn code(&self) -> ResultCode {
        match self {
            RtlsError::NotInitialized | RtlsError::BufferClosed => ResultCode::NotInitialized,
            RtlsError::DeviceNotReady(_) => ResultCode::DeviceNotReady,
            RtlsError::RadioBusy(_) => ResultCode::RadioBusy,
            RtlsError::InvalidParameter(_) => ResultCode::InvalidParameter,
            RtlsError::Io(e) if e.kind() == std::io::ErrorKind::OutOfMemory => {
                ResultCode::OutOfMemory
            }
            RtlsError::Io(_)
            | RtlsError::Json(_)
            | RtlsError::Decode(_)
            | RtlsError::Failure(_)
            | RtlsError::ConnectionClosed => ResultCode::Failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_mapping() {
        assert_eq!(ResultCode::of(&Ok::<(), RtlsError>(())), ResultCode::Ok);
        assert_eq!(
            ResultCode::of::<()>(&Err(RtlsError::RadioBusy(DeviceStatus::Busy))),
            ResultCode::RadioBusy
        );
        assert_eq!(
            RtlsError::DeviceNotReady(DeviceStatus::Bootloader).code(),
            ResultCode::DeviceNotReady
        );
        assert_eq!(RtlsError::NotInitialized.code(), ResultCode::NotInitialized);
        assert_eq!(
            RtlsError::Failure("write".into()).code(),
            ResultCode::Failure
        );
    }

    #[test]
    fn test_error_display() {
        let err = RtlsError::RadioBusy(DeviceStatus::Stop);
        assert_eq!(err.to_string(), "Radio busy (status: Stop)");
    }
}
