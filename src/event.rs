//! Notifications delivered to the application.
//!
//! The provider pushes one [`RtlsEvent`] per observable occurrence onto an
//! unbounded channel returned by
//! [`ProviderBuilder::start`](crate::ProviderBuilder::start). Events are
//! emitted after the engine lock is released, in dispatch order.

use crate::codec::{
    AdhocBeaconResult, DeviceStatusReport, KeepAliveInfo, LedControlResult, PowerUpInfo,
    TagPosition, TagSearchResult, UdControlResult, VersionInfo,
};
use crate::filter::ProximityReport;
use crate::protocol::DeviceId;
use crate::provider::DeviceStatus;

/// Smoothed proximity of the tag being searched for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TagProximity {
    pub tag_id: DeviceId,
    pub report: ProximityReport,
}

/// Result of a firmware transfer step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareOutcome {
    InProgress,
    Succeeded,
    /// Reason string, described through the error catalog.
    Failed(String),
}

/// Firmware transfer progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareProgress {
    /// 0..=100.
    pub percent: u8,
    pub outcome: FirmwareOutcome,
}

impl FirmwareProgress {
    pub(crate) fn in_progress(percent: u8) -> Self {
        Self {
            percent,
            outcome: FirmwareOutcome::InProgress,
        }
    }

    pub(crate) fn succeeded() -> Self {
        Self {
            percent: 100,
            outcome: FirmwareOutcome::Succeeded,
        }
    }

    pub(crate) fn failed(percent: u8, reason: impl Into<String>) -> Self {
        Self {
            percent,
            outcome: FirmwareOutcome::Failed(reason.into()),
        }
    }

    /// Check if the transfer has ended, either way.
    pub fn is_finished(&self) -> bool {
        !matches!(self.outcome, FirmwareOutcome::InProgress)
    }
}

/// Event raised by the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum RtlsEvent {
    /// Device status transition.
    StatusChanged {
        previous: DeviceStatus,
        current: DeviceStatus,
    },
    PowerUp(PowerUpInfo),
    KeepAlive(KeepAliveInfo),
    Version(VersionInfo),
    /// Inventory or Ranging result that passed the select mask.
    TagFound(TagSearchResult),
    /// Read operation result, forwarded unfiltered.
    TagRead(TagSearchResult),
    Proximity(TagProximity),
    AdhocBeacon(AdhocBeaconResult),
    LedControl(LedControlResult),
    UdControl(UdControlResult),
    DeviceStatus(DeviceStatusReport),
    TagPosition(TagPosition),
    FirmwareProgress(FirmwareProgress),
    /// The read loop stopped on a transport error.
    TransportError(String),
    /// The transport reached end of stream.
    TransportClosed,
}
