//! Device status as tracked by the host.

use std::fmt;

use crate::error::{Result, RtlsError};

/// Status of the anchor as last observed.
///
/// ```text
/// Unknown ──version──► Idle ──start──► Busy ──stop──► Stop
///    ▲        │          ▲                              │
///    │        └─0.0.0.0─► Bootloader                    │
///    │                   └────── result / watchdog ─────┘
///    └── power-up (from any state)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceStatus {
    /// Running its bootloader; only firmware upgrade is possible.
    Bootloader,
    Idle,
    /// A search operation is running.
    Busy,
    /// Stop requested, waiting for the last result.
    Stop,
    Error,
    /// No version response seen since start or the last power-up.
    #[default]
    Unknown,
}

impl DeviceStatus {
    /// Check whether a search operation may start.
    ///
    /// # Errors
    ///
    /// `RadioBusy` while an operation runs or stops, `DeviceNotReady`
    /// from every other state except `Idle`.
    pub fn ensure_idle(self) -> Result<()> {
        match self {
            DeviceStatus::Idle => Ok(()),
            DeviceStatus::Busy | DeviceStatus::Stop => Err(RtlsError::RadioBusy(self)),
            DeviceStatus::Bootloader | DeviceStatus::Error | DeviceStatus::Unknown => {
                Err(RtlsError::DeviceNotReady(self))
            }
        }
    }

    /// Check whether a firmware upgrade may start.
    pub fn ensure_upgradable(self) -> Result<()> {
        match self {
            DeviceStatus::Idle | DeviceStatus::Bootloader => Ok(()),
            DeviceStatus::Busy | DeviceStatus::Stop => Err(RtlsError::RadioBusy(self)),
            DeviceStatus::Error | DeviceStatus::Unknown => Err(RtlsError::DeviceNotReady(self)),
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
