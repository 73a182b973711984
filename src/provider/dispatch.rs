//! Protocol engine: device state and per-message handlers.
//!
//! [`Engine`] holds every piece of mutable provider state. It never does
//! I/O itself: handlers and commands append outbound frames and events to
//! an [`Outbox`], which the caller flushes after releasing the lock.

use bytes::Bytes;
use tokio::time::Instant;

use super::config::ProviderConfig;
use super::firmware::{BlockStep, FirmwareSession, MAX_RETRIES};
use super::operation::{check_power_level, OperationParams, SelectMask};
use super::state::DeviceStatus;
use super::watchdog::Watchdog;
use crate::catalog::ErrorCatalog;
use crate::codec::{
    AdhocBeaconResult, BlockAck, DeviceStatusReport, EnterUpgradeAck, ErrorCode, KeepAliveInfo,
    LedControlResult, Payload, PowerUpInfo, TagPosition, TagSearchResult, UdControlResult,
    VersionInfo,
};
use crate::error::{Result, RtlsError};
use crate::event::{FirmwareProgress, RtlsEvent, TagProximity};
use crate::filter::ProximitySmoother;
use crate::protocol::{DeviceId, Frame, MessageId};

/// Frames and events produced while the engine lock is held.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pub frames: Vec<Frame>,
    pub events: Vec<RtlsEvent>,
}

/// Engine state a command may change, kept so the command can be undone
/// when its frames never reach the writer.
#[derive(Debug)]
pub(crate) struct Checkpoint {
    status: DeviceStatus,
    params: Option<OperationParams>,
    stop_requested: bool,
    tags_found: u32,
    smoother: Option<ProximitySmoother>,
    search_index: u8,
    firmware: Option<FirmwareSession>,
}

pub(crate) struct Engine {
    status: DeviceStatus,
    /// Learned from the version response.
    anchor_id: DeviceId,
    version: Option<VersionInfo>,
    params: Option<OperationParams>,
    stop_requested: bool,
    tags_found: u32,
    smoother: Option<ProximitySmoother>,
    search_index: u8,
    select_mask: SelectMask,
    power_level: u8,
    back_off: u8,
    firmware: Option<FirmwareSession>,
    pub(crate) watchdog: Watchdog,
    config: ProviderConfig,
    catalog: ErrorCatalog,
}

impl Engine {
    pub fn new(config: ProviderConfig, catalog: ErrorCatalog) -> Self {
        Self {
            status: DeviceStatus::Unknown,
            anchor_id: DeviceId::BROADCAST,
            version: None,
            params: None,
            stop_requested: false,
            tags_found: 0,
            smoother: None,
            search_index: 0,
            select_mask: SelectMask::all(),
            power_level: config.power_level,
            back_off: config.back_off,
            firmware: None,
            watchdog: Watchdog::default(),
            config,
            catalog,
        }
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn anchor_id(&self) -> DeviceId {
        self.anchor_id
    }

    pub fn version(&self) -> Option<VersionInfo> {
        self.version
    }

    pub fn params(&self) -> Option<&OperationParams> {
        self.params.as_ref()
    }

    pub fn select_mask(&self) -> &SelectMask {
        &self.select_mask
    }

    pub fn power_level(&self) -> u8 {
        self.power_level
    }

    pub fn back_off(&self) -> u8 {
        self.back_off
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            status: self.status,
            params: self.params.clone(),
            stop_requested: self.stop_requested,
            tags_found: self.tags_found,
            smoother: self.smoother.clone(),
            search_index: self.search_index,
            firmware: self.firmware.clone(),
        }
    }

    /// Restore the state saved by [`checkpoint`](Self::checkpoint).
    pub fn rollback(&mut self, checkpoint: Checkpoint, out: &mut Outbox) {
        tracing::debug!(status = %checkpoint.status, "Rolling back unsent command");
        self.params = checkpoint.params;
        self.stop_requested = checkpoint.stop_requested;
        self.tags_found = checkpoint.tags_found;
        self.smoother = checkpoint.smoother;
        self.search_index = checkpoint.search_index;
        self.firmware = checkpoint.firmware;
        self.set_status(checkpoint.status, out);
    }

    fn set_status(&mut self, status: DeviceStatus, out: &mut Outbox) {
        if self.status == status {
            return;
        }
        tracing::debug!(from = %self.status, to = %status, "Device status changed");
        out.events.push(RtlsEvent::StatusChanged {
            previous: self.status,
            current: status,
        });
        self.status = status;
    }

    /// Build a command frame addressed to the anchor.
    pub fn command<P: Payload>(&self, payload: &P) -> Frame {
        Frame::command(self.anchor_id, P::MESSAGE_ID, payload.encode())
    }

    /// Build a command frame with an empty payload.
    pub fn request(&self, message_id: MessageId) -> Frame {
        Frame::command(self.anchor_id, message_id, Bytes::new())
    }

    /// Reject commands that need the application firmware.
    pub fn ensure_application(&self) -> Result<()> {
        match self.status {
            DeviceStatus::Bootloader => Err(RtlsError::DeviceNotReady(self.status)),
            _ => Ok(()),
        }
    }

    // ----- commands -----

    pub fn start_operation(
        &mut self,
        params: OperationParams,
        now: Instant,
        out: &mut Outbox,
    ) -> Result<()> {
        params.validate()?;
        self.status.ensure_idle()?;

        self.smoother = match &params {
            OperationParams::Searching { rolling_window, .. } => Some(ProximitySmoother::new(
                *rolling_window,
                self.config.average_window,
                self.config.min_report_samples,
                self.config.report_interval(),
                now,
            )),
            _ => None,
        };
        tracing::debug!(mode = ?params.mode(), "Starting operation");
        self.params = Some(params);
        self.tags_found = 0;
        self.stop_requested = false;
        self.set_status(DeviceStatus::Busy, out);
        self.issue_search(out);
        Ok(())
    }

    /// Flag a running operation to stop. Returns `true` when the stop
    /// watchdog must be armed.
    pub fn request_stop(&mut self, out: &mut Outbox) -> bool {
        if self.status != DeviceStatus::Busy {
            return false;
        }
        self.stop_requested = true;
        self.set_status(DeviceStatus::Stop, out);
        true
    }

    /// Stop watchdog expiry.
    pub fn on_watchdog(&mut self, generation: u64, out: &mut Outbox) {
        if !self.watchdog.fire(generation) {
            return;
        }
        if self.status == DeviceStatus::Stop {
            tracing::warn!("Stop not confirmed by device, forcing idle");
            self.finish_operation(out);
        }
    }

    pub fn set_select_mask(&mut self, mask: SelectMask) {
        self.select_mask = mask;
    }

    pub fn set_power_level(&mut self, level: u8) -> Result<()> {
        check_power_level(level)?;
        self.power_level = level;
        Ok(())
    }

    pub fn set_back_off(&mut self, back_off: u8) {
        self.back_off = back_off;
    }

    /// Open a firmware session and ask the device to enter upgrade mode.
    pub fn begin_firmware_upgrade(&mut self, image: Bytes, out: &mut Outbox) -> Result<()> {
        let session = FirmwareSession::new(image)?;
        self.status.ensure_upgradable()?;

        if self.firmware.is_some() {
            tracing::warn!("Replacing unfinished firmware session");
        }
        tracing::debug!(blocks = session.total_blocks(), "Entering firmware upgrade");
        out.frames.push(self.command(&session.enter_request()));
        self.firmware = Some(session);
        Ok(())
    }

    fn issue_search(&mut self, out: &mut Outbox) {
        let index: u8 = rand::random();
        self.search_index = index;

        let Some(params) = self.params.as_ref() else {
            return;
        };
        let request = params.search_request(index, self.power_level, self.back_off);
        out.frames.push(self.command(&request));
    }

    fn finish_operation(&mut self, out: &mut Outbox) {
        self.stop_requested = false;
        self.smoother = None;
        self.watchdog.disarm();
        self.set_status(DeviceStatus::Idle, out);
    }

    fn recover(&mut self, out: &mut Outbox) {
        self.set_status(DeviceStatus::Error, out);
        self.finish_operation(out);
    }

    // ----- dispatch -----

    /// Handle one decoded frame.
    ///
    /// A handler error puts the device through `Error` back to `Idle`.
    pub fn handle_frame(&mut self, frame: &Frame, now: Instant, out: &mut Outbox) {
        tracing::debug!(
            message_id = ?frame.message_id,
            device = %frame.device_id,
            len = frame.payload_len(),
            "Dispatching frame"
        );
        if let Err(e) = self.route(frame, now, out) {
            tracing::error!("Handler error for {:?}: {}", frame.message_id, e);
            self.recover(out);
        }
    }

    /// Handle text between markers that did not decode to a frame.
    pub fn handle_decode_error(&mut self, error: &RtlsError, out: &mut Outbox) {
        tracing::warn!("Discarding undecodable frame: {}", error);
        self.recover(out);
    }

    fn route(&mut self, frame: &Frame, now: Instant, out: &mut Outbox) -> Result<()> {
        let data = frame.payload();
        match frame.message_id {
            MessageId::VersionNotify => {
                self.on_version(frame.device_id, VersionInfo::decode(data)?, out)
            }
            MessageId::PowerUpNotify => self.on_power_up(PowerUpInfo::decode(data)?, out),
            MessageId::KeepAliveNotify => out
                .events
                .push(RtlsEvent::KeepAlive(KeepAliveInfo::decode(data)?)),
            MessageId::TagAnchorSearchNotify => {
                self.on_search_result(TagSearchResult::decode(data)?, now, out)
            }
            MessageId::AdhocBeaconNotify => out
                .events
                .push(RtlsEvent::AdhocBeacon(AdhocBeaconResult::decode(data)?)),
            MessageId::LedControlNotify => out
                .events
                .push(RtlsEvent::LedControl(LedControlResult::decode(data)?)),
            MessageId::UdControlNotify => out
                .events
                .push(RtlsEvent::UdControl(UdControlResult::decode(data)?)),
            MessageId::DeviceStatusNotify => out
                .events
                .push(RtlsEvent::DeviceStatus(DeviceStatusReport::decode(data)?)),
            MessageId::TagPositionNotify => out
                .events
                .push(RtlsEvent::TagPosition(TagPosition::decode(data)?)),
            MessageId::EnterFirmwareUpgradeNotify => {
                self.on_enter_ack(EnterUpgradeAck::decode(data)?, out)
            }
            MessageId::StartFirmwareUpgradeNotify => {
                self.on_block_ack(BlockAck::decode(data)?, out)
            }
            request => {
                tracing::warn!("Ignoring host request {:?} sent by device", request);
            }
        }
        Ok(())
    }

    fn on_version(&mut self, anchor_id: DeviceId, info: VersionInfo, out: &mut Outbox) {
        self.anchor_id = anchor_id;
        self.version = Some(info);

        let next = if info.is_bootloader() {
            DeviceStatus::Bootloader
        } else {
            match self.status {
                DeviceStatus::Busy | DeviceStatus::Stop => self.status,
                _ => DeviceStatus::Idle,
            }
        };
        self.set_status(next, out);
        out.events.push(RtlsEvent::Version(info));
    }

    fn on_power_up(&mut self, info: PowerUpInfo, out: &mut Outbox) {
        out.events.push(RtlsEvent::PowerUp(info));

        let reset_for_upgrade = self
            .firmware
            .as_mut()
            .is_some_and(|session| std::mem::take(&mut session.reset_pending));
        if reset_for_upgrade {
            tracing::debug!("Device reset into bootloader, starting firmware transfer");
            self.start_transfer(out);
            return;
        }

        self.stop_requested = false;
        self.smoother = None;
        self.watchdog.disarm();
        self.set_status(DeviceStatus::Unknown, out);
        out.frames.push(self.request(MessageId::GetVersion));
    }

    fn on_search_result(&mut self, result: TagSearchResult, now: Instant, out: &mut Outbox) {
        if self.stop_requested && self.status == DeviceStatus::Stop {
            tracing::debug!("Search result completes stop");
            self.finish_operation(out);
            return;
        }
        if self.status != DeviceStatus::Busy {
            tracing::debug!(status = %self.status, "Dropping search result while not busy");
            return;
        }
        if result.search_index != self.search_index {
            tracing::debug!(
                expected = self.search_index,
                got = result.search_index,
                "Search index mismatch"
            );
        }

        let Some(params) = self.params.clone() else {
            return;
        };
        match params {
            OperationParams::Inventory { stop_after, .. } => {
                self.on_tag_result(result, stop_after, out)
            }
            OperationParams::Ranging { .. } => self.on_tag_result(result, 0, out),
            OperationParams::Searching { mask, .. } => {
                if result.error != ErrorCode::NoError {
                    self.log_search_error(result.error);
                } else if result.tag_id != mask {
                    tracing::debug!(tag = %result.tag_id, "Ignoring result for other tag");
                } else if let Some(smoother) = self.smoother.as_mut() {
                    let report =
                        smoother.push(result.rssi as i32, result.distance_cm as i32, now);
                    if let Some(report) = report {
                        out.events.push(RtlsEvent::Proximity(TagProximity {
                            tag_id: result.tag_id,
                            report,
                        }));
                    }
                }
                self.issue_search(out);
            }
            OperationParams::Read { .. } => out.events.push(RtlsEvent::TagRead(result)),
        }
    }

    /// Inventory and Ranging result: report, then keep searching.
    fn on_tag_result(&mut self, result: TagSearchResult, stop_after: u32, out: &mut Outbox) {
        if result.error != ErrorCode::NoError {
            self.log_search_error(result.error);
        } else if self.select_mask.matches(&result.tag_id) {
            self.tags_found += 1;
            out.events.push(RtlsEvent::TagFound(result));
            if stop_after > 0 && self.tags_found >= stop_after {
                tracing::debug!(tags = self.tags_found, "Inventory target reached");
                self.finish_operation(out);
                return;
            }
        }
        self.issue_search(out);
    }

    fn log_search_error(&self, error: ErrorCode) {
        if error.is_no_response() {
            tracing::debug!("No tag response, re-issuing search");
        } else {
            tracing::warn!("Search failed: {}", self.catalog.describe(error));
        }
    }

    fn start_transfer(&mut self, out: &mut Outbox) {
        let Some(session) = self.firmware.as_ref() else {
            return;
        };
        let frame = self.command(&session.current_block());
        self.set_status(DeviceStatus::Bootloader, out);
        out.frames.push(frame);
        out.events
            .push(RtlsEvent::FirmwareProgress(FirmwareProgress::in_progress(0)));
    }

    fn on_enter_ack(&mut self, ack: EnterUpgradeAck, out: &mut Outbox) {
        if self.firmware.is_none() {
            tracing::warn!("Enter-upgrade response without a firmware session");
            return;
        }

        match ack.error {
            ErrorCode::InBootloader => self.start_transfer(out),
            ErrorCode::NoError if self.status == DeviceStatus::Bootloader => {
                self.start_transfer(out)
            }
            ErrorCode::ChecksumOkResetRequired => {
                tracing::debug!("Firmware transfer deferred until device reset");
                if let Some(session) = self.firmware.as_mut() {
                    session.reset_pending = true;
                }
            }
            error => {
                let reason = self.catalog.describe(error);
                tracing::warn!("Firmware upgrade rejected: {}", reason);
                self.firmware = None;
                out.events
                    .push(RtlsEvent::FirmwareProgress(FirmwareProgress::failed(0, reason)));
            }
        }
    }

    fn on_block_ack(&mut self, ack: BlockAck, out: &mut Outbox) {
        let Some(session) = self.firmware.as_mut() else {
            tracing::warn!("Block acknowledgement without a firmware session");
            return;
        };

        match session.on_block_ack(&ack) {
            BlockStep::Send { block, percent } => {
                out.frames.push(self.command(&block));
                out.events
                    .push(RtlsEvent::FirmwareProgress(FirmwareProgress::in_progress(percent)));
            }
            BlockStep::AwaitCommit => {
                out.events
                    .push(RtlsEvent::FirmwareProgress(FirmwareProgress::in_progress(100)));
            }
            BlockStep::Retry { block, retries } => {
                tracing::warn!(
                    retries,
                    block = block.block_index,
                    "Firmware block rejected: {}",
                    self.catalog.describe(ack.error)
                );
                out.frames.push(self.command(&block));
            }
            BlockStep::Succeeded => {
                tracing::debug!("Firmware upgrade complete");
                self.firmware = None;
                out.events
                    .push(RtlsEvent::FirmwareProgress(FirmwareProgress::succeeded()));
            }
            BlockStep::Failed { percent, error } => {
                let reason = format!(
                    "gave up after {} retries: {}",
                    MAX_RETRIES,
                    self.catalog.describe(error)
                );
                tracing::error!("Firmware upgrade failed, {}", reason);
                self.firmware = None;
                out.events
                    .push(RtlsEvent::FirmwareProgress(FirmwareProgress::failed(percent, reason)));
            }
            BlockStep::Ignored => {
                tracing::debug!("Ignoring block acknowledgement after session end");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{search_options, BlockWrite, SearchMode, SearchRequest, Version};
    use crate::event::FirmwareOutcome;
    use std::time::Duration;

    const ANCHOR: DeviceId = DeviceId::new([0xA0, 0, 0, 0, 0, 0x01]);
    const TAG: DeviceId = DeviceId::new([0xE2, 0, 0, 0, 0, 0x07]);
    const OTHER: DeviceId = DeviceId::new([0x30, 0, 0, 0, 0, 0x08]);

    fn engine() -> Engine {
        Engine::new(ProviderConfig::default(), ErrorCatalog::builtin())
    }

    fn notify<P: Payload>(payload: &P) -> Frame {
        Frame::new(ANCHOR, P::MESSAGE_ID, payload.encode())
    }

    fn deliver<P: Payload>(engine: &mut Engine, payload: &P) -> Outbox {
        deliver_at(engine, payload, Instant::now())
    }

    fn deliver_at<P: Payload>(engine: &mut Engine, payload: &P, now: Instant) -> Outbox {
        let mut out = Outbox::default();
        engine.handle_frame(&notify(payload), now, &mut out);
        out
    }

    fn version(application: [u8; 4]) -> VersionInfo {
        VersionInfo {
            application: Version(application),
            bootloader: Version([1, 0, 0, 0]),
        }
    }

    fn idle_engine() -> Engine {
        let mut engine = engine();
        deliver(&mut engine, &version([2, 1, 0, 0]));
        assert_eq!(engine.status(), DeviceStatus::Idle);
        engine
    }

    fn start(engine: &mut Engine, params: OperationParams) -> Outbox {
        let mut out = Outbox::default();
        engine
            .start_operation(params, Instant::now(), &mut out)
            .unwrap();
        out
    }

    fn result(error: ErrorCode, tag_id: DeviceId) -> TagSearchResult {
        TagSearchResult {
            search_index: 0,
            error,
            tag_id,
            rssi: -55,
            distance_cm: 120,
            data: Bytes::new(),
        }
    }

    fn search_requests(out: &Outbox) -> Vec<SearchRequest> {
        out.frames
            .iter()
            .filter(|f| f.message_id == MessageId::TagAnchorSearch)
            .map(|f| SearchRequest::decode(f.payload()).unwrap())
            .collect()
    }

    fn block_writes(out: &Outbox) -> Vec<BlockWrite> {
        out.frames
            .iter()
            .filter(|f| f.message_id == MessageId::StartFirmwareUpgrade)
            .map(|f| BlockWrite::decode(f.payload()).unwrap())
            .collect()
    }

    fn firmware_outcomes(out: &Outbox) -> Vec<FirmwareProgress> {
        out.events
            .iter()
            .filter_map(|e| match e {
                RtlsEvent::FirmwareProgress(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_version_zero_enters_bootloader() {
        let mut engine = engine();
        let out = deliver(&mut engine, &version([0, 0, 0, 0]));

        assert_eq!(engine.status(), DeviceStatus::Bootloader);
        assert_eq!(engine.anchor_id(), ANCHOR);
        assert_eq!(
            out.events[0],
            RtlsEvent::StatusChanged {
                previous: DeviceStatus::Unknown,
                current: DeviceStatus::Bootloader
            }
        );
        assert!(matches!(out.events[1], RtlsEvent::Version(v) if v.is_bootloader()));
    }

    #[test]
    fn test_commands_addressed_to_learned_anchor() {
        let engine = idle_engine();
        assert_eq!(engine.request(MessageId::KeepAlive).device_id, ANCHOR);
    }

    #[test]
    fn test_start_operation_from_idle() {
        let mut engine = idle_engine();
        let out = start(&mut engine, OperationParams::inventory());

        assert_eq!(engine.status(), DeviceStatus::Busy);
        let requests = search_requests(&out);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].mode, SearchMode::Inventory);
        assert_eq!(requests[0].power_level, engine.power_level());
    }

    #[test]
    fn test_start_operation_while_busy_keeps_params() {
        let mut engine = idle_engine();
        start(&mut engine, OperationParams::inventory());

        let mut out = Outbox::default();
        let err = engine
            .start_operation(OperationParams::searching(TAG, 3), Instant::now(), &mut out)
            .unwrap_err();

        assert!(matches!(err, RtlsError::RadioBusy(DeviceStatus::Busy)));
        assert_eq!(engine.params(), Some(&OperationParams::inventory()));
        assert!(out.frames.is_empty());
    }

    #[test]
    fn test_start_operation_before_version() {
        let mut engine = engine();
        let mut out = Outbox::default();
        let err = engine
            .start_operation(OperationParams::inventory(), Instant::now(), &mut out)
            .unwrap_err();
        assert!(matches!(err, RtlsError::DeviceNotReady(DeviceStatus::Unknown)));
        assert!(engine.params().is_none());
    }

    #[test]
    fn test_inventory_reissues_on_no_response() {
        let mut engine = idle_engine();
        start(&mut engine, OperationParams::inventory());

        for error in [ErrorCode::NoResponse, ErrorCode::InventoryTimeout] {
            let out = deliver(&mut engine, &result(error, DeviceId::default()));
            assert_eq!(search_requests(&out).len(), 1);
            assert!(out.events.is_empty());
        }
        assert_eq!(engine.status(), DeviceStatus::Busy);
    }

    #[test]
    fn test_inventory_applies_select_mask() {
        let mut engine = idle_engine();
        engine.set_select_mask(SelectMask::new(0, 8, [0xE2]).unwrap());
        start(&mut engine, OperationParams::inventory());

        let out = deliver(&mut engine, &result(ErrorCode::NoError, OTHER));
        assert!(out.events.is_empty());
        assert_eq!(search_requests(&out).len(), 1);

        let out = deliver(&mut engine, &result(ErrorCode::NoError, TAG));
        assert!(matches!(&out.events[0], RtlsEvent::TagFound(r) if r.tag_id == TAG));
    }

    #[test]
    fn test_inventory_stop_after() {
        let mut engine = idle_engine();
        start(
            &mut engine,
            OperationParams::Inventory {
                led_blink: false,
                mask: None,
                stop_after: 2,
            },
        );

        deliver(&mut engine, &result(ErrorCode::NoError, TAG));
        assert_eq!(engine.status(), DeviceStatus::Busy);

        let out = deliver(&mut engine, &result(ErrorCode::NoError, OTHER));
        assert_eq!(engine.status(), DeviceStatus::Idle);
        assert!(search_requests(&out).is_empty());
    }

    #[test]
    fn test_stop_completes_on_next_result() {
        let mut engine = idle_engine();
        start(&mut engine, OperationParams::inventory());

        let mut out = Outbox::default();
        assert!(engine.request_stop(&mut out));
        assert_eq!(engine.status(), DeviceStatus::Stop);
        assert!(!engine.request_stop(&mut out));

        let out = deliver(&mut engine, &result(ErrorCode::NoError, TAG));
        assert_eq!(engine.status(), DeviceStatus::Idle);
        assert!(out.frames.is_empty());
        assert!(!out
            .events
            .iter()
            .any(|e| matches!(e, RtlsEvent::TagFound(_))));
    }

    #[test]
    fn test_stale_watchdog_generation_ignored() {
        let mut engine = idle_engine();
        start(&mut engine, OperationParams::inventory());

        let mut out = Outbox::default();
        engine.request_stop(&mut out);
        engine.on_watchdog(42, &mut out);
        assert_eq!(engine.status(), DeviceStatus::Stop);
    }

    #[test]
    fn test_result_while_idle_dropped() {
        let mut engine = idle_engine();
        let out = deliver(&mut engine, &result(ErrorCode::NoError, TAG));
        assert!(out.frames.is_empty());
        assert!(out.events.is_empty());
    }

    #[test]
    fn test_searching_reports_proximity() {
        let mut engine = idle_engine();
        let t0 = Instant::now();
        let mut out = Outbox::default();
        engine
            .start_operation(OperationParams::searching(TAG, 3), t0, &mut out)
            .unwrap();
        assert_eq!(search_requests(&out)[0].tag_mask, TAG);

        let out = deliver_at(&mut engine, &result(ErrorCode::NoError, OTHER), t0);
        assert!(out.events.is_empty());
        assert_eq!(search_requests(&out).len(), 1);

        let mut reports = Vec::new();
        for i in 0..10u64 {
            let now = t0 + Duration::from_millis(200 * (i + 1));
            let out = deliver_at(&mut engine, &result(ErrorCode::NoError, TAG), now);
            assert_eq!(search_requests(&out).len(), 1);
            reports.extend(out.events.into_iter().filter_map(|e| match e {
                RtlsEvent::Proximity(p) => Some(p),
                _ => None,
            }));
        }

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].tag_id, TAG);
        assert_eq!(reports[0].report.samples, 10);
        assert_eq!(reports[0].report.rssi, -55.0);
    }

    #[test]
    fn test_read_forwards_errors_without_retry() {
        let mut engine = idle_engine();
        start(
            &mut engine,
            OperationParams::Read {
                led_blink: true,
                mask: Some(TAG),
            },
        );

        let out = deliver(&mut engine, &result(ErrorCode::NoResponse, TAG));
        assert!(out.frames.is_empty());
        assert!(matches!(&out.events[0], RtlsEvent::TagRead(r) if r.error == ErrorCode::NoResponse));
    }

    #[test]
    fn test_power_up_requeries_version() {
        let mut engine = idle_engine();
        start(&mut engine, OperationParams::inventory());

        let out = deliver(&mut engine, &PowerUpInfo { reset_cause: 1 });
        assert_eq!(engine.status(), DeviceStatus::Unknown);
        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.frames[0].message_id, MessageId::GetVersion);
        assert!(matches!(out.events[0], RtlsEvent::PowerUp(_)));
    }

    #[test]
    fn test_truncated_payload_recovers_to_idle() {
        let mut engine = idle_engine();
        start(&mut engine, OperationParams::inventory());

        let mut out = Outbox::default();
        let frame = Frame::new(ANCHOR, MessageId::TagAnchorSearchNotify, vec![0x01u8]);
        engine.handle_frame(&frame, Instant::now(), &mut out);

        assert_eq!(engine.status(), DeviceStatus::Idle);
        let statuses: Vec<_> = out
            .events
            .iter()
            .filter_map(|e| match e {
                RtlsEvent::StatusChanged { current, .. } => Some(*current),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![DeviceStatus::Error, DeviceStatus::Idle]);
    }

    #[test]
    fn test_decode_error_recovers_to_idle() {
        let mut engine = idle_engine();
        let mut out = Outbox::default();
        engine.handle_decode_error(&RtlsError::Decode("odd hex length 3".into()), &mut out);
        assert_eq!(engine.status(), DeviceStatus::Idle);
        assert_eq!(out.events.len(), 2);
    }

    #[test]
    fn test_firmware_upgrade_state_checks() {
        let mut engine = engine();
        let mut out = Outbox::default();
        assert!(matches!(
            engine.begin_firmware_upgrade(Bytes::from_static(&[1; 10]), &mut out),
            Err(RtlsError::DeviceNotReady(DeviceStatus::Unknown))
        ));
        assert!(matches!(
            engine.begin_firmware_upgrade(Bytes::new(), &mut out),
            Err(RtlsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_firmware_in_bootloader_starts_transfer() {
        let mut engine = idle_engine();
        let mut out = Outbox::default();
        engine
            .begin_firmware_upgrade(Bytes::from(vec![0xAB; 100]), &mut out)
            .unwrap();
        assert_eq!(out.frames[0].message_id, MessageId::EnterFirmwareUpgrade);

        let out = deliver(
            &mut engine,
            &EnterUpgradeAck {
                error: ErrorCode::InBootloader,
            },
        );
        assert_eq!(engine.status(), DeviceStatus::Bootloader);
        assert_eq!(block_writes(&out)[0].block_index, 0);

        let out = deliver(
            &mut engine,
            &BlockAck {
                error: ErrorCode::NoError,
                block_index: 0,
            },
        );
        assert_eq!(block_writes(&out)[0].block_index, 1);
        assert_eq!(firmware_outcomes(&out)[0].percent, 50);

        deliver(
            &mut engine,
            &BlockAck {
                error: ErrorCode::NoError,
                block_index: 1,
            },
        );
        let out = deliver(
            &mut engine,
            &BlockAck {
                error: ErrorCode::WriteInfoOk,
                block_index: 1,
            },
        );
        assert_eq!(firmware_outcomes(&out), vec![FirmwareProgress::succeeded()]);
    }

    #[test]
    fn test_firmware_reset_required_waits_for_power_up() {
        let mut engine = idle_engine();
        let mut out = Outbox::default();
        engine
            .begin_firmware_upgrade(Bytes::from(vec![0x11; 64]), &mut out)
            .unwrap();

        let out = deliver(
            &mut engine,
            &EnterUpgradeAck {
                error: ErrorCode::ChecksumOkResetRequired,
            },
        );
        assert!(out.frames.is_empty());
        assert_eq!(engine.status(), DeviceStatus::Idle);

        let out = deliver(&mut engine, &PowerUpInfo { reset_cause: 0 });
        assert_eq!(engine.status(), DeviceStatus::Bootloader);
        assert_eq!(block_writes(&out).len(), 1);
        assert!(!out
            .frames
            .iter()
            .any(|f| f.message_id == MessageId::GetVersion));

        // One shot: the next power-up is handled normally.
        let out = deliver(&mut engine, &PowerUpInfo { reset_cause: 0 });
        assert_eq!(engine.status(), DeviceStatus::Unknown);
        assert_eq!(out.frames[0].message_id, MessageId::GetVersion);
    }

    #[test]
    fn test_firmware_enter_rejected() {
        let mut engine = idle_engine();
        let mut out = Outbox::default();
        engine
            .begin_firmware_upgrade(Bytes::from(vec![0x11; 64]), &mut out)
            .unwrap();

        let out = deliver(
            &mut engine,
            &EnterUpgradeAck {
                error: ErrorCode::DeviceBusy,
            },
        );
        let outcomes = firmware_outcomes(&out);
        assert!(matches!(&outcomes[0].outcome, FirmwareOutcome::Failed(r) if r.contains("DEVICE_BUSY")));
    }

    #[test]
    fn test_firmware_gives_up_after_ten_failures() {
        let mut engine = engine();
        deliver(&mut engine, &version([0, 0, 0, 0]));

        let mut out = Outbox::default();
        engine
            .begin_firmware_upgrade(Bytes::from(vec![0x5A; 64 * 3]), &mut out)
            .unwrap();

        let mut sent = block_writes(&deliver(
            &mut engine,
            &EnterUpgradeAck {
                error: ErrorCode::NoError,
            },
        ))
        .len();
        let mut outcomes = Vec::new();
        for _ in 0..12 {
            let out = deliver(
                &mut engine,
                &BlockAck {
                    error: ErrorCode::WriteFlashFailed,
                    block_index: 0,
                },
            );
            sent += block_writes(&out).len();
            outcomes.extend(firmware_outcomes(&out));
        }

        assert_eq!(sent, 10);
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0].outcome, FirmwareOutcome::Failed(_)));
    }

    #[test]
    fn test_rollback_restores_idle_after_unsent_start() {
        let mut engine = idle_engine();
        let checkpoint = engine.checkpoint();
        start(&mut engine, OperationParams::inventory());
        assert_eq!(engine.status(), DeviceStatus::Busy);

        let mut out = Outbox::default();
        engine.rollback(checkpoint, &mut out);

        assert_eq!(engine.status(), DeviceStatus::Idle);
        assert!(engine.params().is_none());
        assert_eq!(
            out.events,
            vec![RtlsEvent::StatusChanged {
                previous: DeviceStatus::Busy,
                current: DeviceStatus::Idle
            }]
        );
        start(&mut engine, OperationParams::searching(TAG, 3));
    }

    #[test]
    fn test_rollback_drops_unsent_firmware_session() {
        let mut engine = idle_engine();
        let checkpoint = engine.checkpoint();

        let mut out = Outbox::default();
        engine
            .begin_firmware_upgrade(Bytes::from(vec![0x5A; 64]), &mut out)
            .unwrap();
        engine.rollback(checkpoint, &mut Outbox::default());

        let out = deliver(
            &mut engine,
            &EnterUpgradeAck {
                error: ErrorCode::InBootloader,
            },
        );
        assert!(block_writes(&out).is_empty());
        assert!(firmware_outcomes(&out).is_empty());
    }

    #[test]
    fn test_ranging_toggles_session_and_reissues_with_back_off() {
        let mut engine = idle_engine();
        engine.set_back_off(7);
        let out = start(
            &mut engine,
            OperationParams::Ranging {
                led_blink: false,
                mask: None,
            },
        );

        let first = &search_requests(&out)[0];
        assert_eq!(first.mode, SearchMode::Ranging);
        assert_ne!(first.options & search_options::TOGGLE_SESSION, 0);
        assert_eq!(first.back_off, 7);

        let out = deliver(&mut engine, &result(ErrorCode::NoResponse, DeviceId::default()));
        let retry = &search_requests(&out)[0];
        assert_eq!(retry.mode, SearchMode::Ranging);
        assert_eq!(retry.back_off, 7);
        assert!(out.events.is_empty());

        let out = deliver(&mut engine, &result(ErrorCode::NoError, TAG));
        assert!(matches!(&out.events[0], RtlsEvent::TagFound(r) if r.tag_id == TAG));
        assert_eq!(search_requests(&out).len(), 1);
        assert_eq!(engine.status(), DeviceStatus::Busy);
    }
}
