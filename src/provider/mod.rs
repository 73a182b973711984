//! Provider builder and runtime loop.
//!
//! The [`ProviderBuilder`] collects configuration and the error catalog,
//! then [`start`](ProviderBuilder::start) takes the two halves of a byte
//! transport and returns a running [`Provider`] plus the event receiver.
//!
//! A running provider owns two tasks:
//! 1. the read loop: transport bytes → [`FrameBuffer`] → engine dispatch;
//! 2. the writer task: queued frames → transport.
//!
//! Commands lock the engine, queue frames and events, release the lock and
//! only then await the writer.
//!
//! # Example
//!
//! ```no_run
//! use rtls_provider::{OperationParams, ProviderBuilder, RtlsEvent};
//!
//! # async fn run() -> rtls_provider::Result<()> {
//! let (host, _device) = tokio::io::duplex(4096);
//! let (reader, writer) = tokio::io::split(host);
//!
//! let (provider, mut events) = ProviderBuilder::new().start(reader, writer).await?;
//! provider.start_operation(OperationParams::inventory()).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let RtlsEvent::TagFound(tag) = event {
//!         println!("{} at {} cm", tag.tag_id, tag.distance_cm);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod dispatch;
mod firmware;
mod operation;
mod state;
mod watchdog;

pub use config::ProviderConfig;
pub use firmware::{BLOCK_SIZE, MAX_BLOCKS, MAX_RETRIES, ROLLBACK_DIVISOR};
pub use operation::{OperationParams, SelectMask, DEFAULT_POWER_LEVEL, MAX_POWER_LEVEL};
pub use state::DeviceStatus;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::catalog::ErrorCatalog;
use crate::codec::{AdhocBeaconRequest, LedControlRequest, UdControlRequest, VersionInfo};
use crate::error::{Result, RtlsError};
use crate::event::RtlsEvent;
use crate::protocol::{DeviceId, Frame, FrameBuffer, MessageId};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

use dispatch::{Engine, Outbox};

/// Builder for configuring and starting a provider.
pub struct ProviderBuilder {
    config: ProviderConfig,
    catalog: ErrorCatalog,
}

impl ProviderBuilder {
    /// Create a builder with default configuration and the built-in
    /// error catalog.
    pub fn new() -> Self {
        Self {
            config: ProviderConfig::default(),
            catalog: ErrorCatalog::builtin(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ProviderConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the device error-code catalog.
    pub fn error_catalog(mut self, catalog: ErrorCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Time a stop may take before the watchdog forces `Idle`.
    ///
    /// Default: 5 seconds
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Pause after `stop_operation` sets the stop flag.
    ///
    /// Default: 100 ms
    pub fn stop_settle(mut self, settle: Duration) -> Self {
        self.config.stop_settle_ms = settle.as_millis() as u64;
        self
    }

    /// Minimum spacing of proximity reports.
    ///
    /// Default: 1 second
    pub fn report_interval(mut self, interval: Duration) -> Self {
        self.config.report_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Samples needed before a proximity report.
    ///
    /// Default: 10
    pub fn min_report_samples(mut self, samples: u32) -> Self {
        self.config.min_report_samples = samples;
        self
    }

    pub fn average_window(mut self, window: usize) -> Self {
        self.config.average_window = window;
        self
    }

    pub fn power_level(mut self, level: u8) -> Self {
        self.config.power_level = level;
        self
    }

    pub fn back_off(mut self, back_off: u8) -> Self {
        self.config.back_off = back_off;
        self
    }

    /// Send `GetVersion` right after starting.
    ///
    /// Default: true
    pub fn query_version_on_start(mut self, enabled: bool) -> Self {
        self.config.query_version_on_start = enabled;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 256
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Cap on buffered text without a complete frame.
    ///
    /// Default: 64 KiB
    pub fn max_buffered(mut self, max: usize) -> Self {
        self.config.max_buffered = max;
        self
    }

    /// Build and start the provider on a transport.
    ///
    /// Spawns the read loop and the writer task, so this must run inside a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` for an invalid configuration, or the
    /// writer error if the initial `GetVersion` cannot be queued.
    pub async fn start<R, W>(
        self,
        reader: R,
        writer: W,
    ) -> Result<(Provider, mpsc::UnboundedReceiver<RtlsEvent>)>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Provider::start(self.config, self.catalog, reader, writer).await
    }

    /// Open a serial port and start the provider on it.
    #[cfg(feature = "serial")]
    pub async fn start_serial(
        self,
        path: &str,
        baud_rate: u32,
    ) -> Result<(Provider, mpsc::UnboundedReceiver<RtlsEvent>)> {
        let port = crate::transport::open_serial(path, baud_rate)?;
        let (reader, writer) = tokio::io::split(port);
        self.start(reader, writer).await
    }
}

impl Default for ProviderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by the command API, the read loop and the watchdog.
struct Shared {
    engine: Mutex<Engine>,
    writer: WriterHandle,
    events: mpsc::UnboundedSender<RtlsEvent>,
    disposed: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(RtlsError::NotInitialized);
        }
        Ok(())
    }

    fn emit(&self, event: RtlsEvent) {
        if self.is_disposed() {
            return;
        }
        // A dropped receiver only means nobody is listening.
        let _ = self.events.send(event);
    }

    /// Deliver queued events, then queued frames.
    async fn flush(&self, out: Outbox) -> Result<()> {
        for event in out.events {
            self.emit(event);
        }
        self.send_frames(&out.frames).await
    }

    async fn send_frames(&self, frames: &[Frame]) -> Result<()> {
        for frame in frames {
            if self.is_disposed() {
                return Err(RtlsError::NotInitialized);
            }
            self.writer
                .send(OutboundFrame::new(frame)?)
                .await
                .map_err(|e| RtlsError::Failure(format!("{:?} not sent: {}", frame.message_id, e)))?;
        }
        Ok(())
    }

    /// Run a command against the engine and send what it queued.
    ///
    /// Events are only emitted once every frame is queued. If a frame cannot
    /// be sent, the engine is rolled back to its state before the command.
    async fn run<T>(&self, command: impl FnOnce(&mut Engine, &mut Outbox) -> Result<T>) -> Result<T> {
        self.ensure_open()?;
        let (value, out, checkpoint) = {
            let mut engine = self.lock();
            let checkpoint = engine.checkpoint();
            let mut out = Outbox::default();
            let value = command(&mut engine, &mut out)?;
            (value, out, checkpoint)
        };

        if let Err(e) = self.send_frames(&out.frames).await {
            tracing::warn!("Command not sent, rolling back: {}", e);
            // The command's events were never emitted, so neither are the
            // rollback's.
            self.lock().rollback(checkpoint, &mut Outbox::default());
            return Err(e);
        }
        for event in out.events {
            self.emit(event);
        }
        Ok(value)
    }

    async fn dispatch(&self, result: Result<Frame>) {
        if self.is_disposed() {
            return;
        }
        let out = {
            let mut engine = self.lock();
            let mut out = Outbox::default();
            match result {
                Ok(frame) => engine.handle_frame(&frame, Instant::now(), &mut out),
                Err(e) => engine.handle_decode_error(&e, &mut out),
            }
            out
        };
        if let Err(e) = self.flush(out).await {
            tracing::error!("Failed to send follow-up frame: {}", e);
        }
    }

    async fn on_watchdog(&self, generation: u64) {
        if self.is_disposed() {
            return;
        }
        let out = {
            let mut engine = self.lock();
            let mut out = Outbox::default();
            engine.on_watchdog(generation, &mut out);
            out
        };
        if let Err(e) = self.flush(out).await {
            tracing::error!("Watchdog flush failed: {}", e);
        }
    }
}

/// A running provider bound to one anchor.
///
/// Dropping the provider shuts it down.
pub struct Provider {
    shared: Arc<Shared>,
    read_task: JoinHandle<()>,
    writer_task: JoinHandle<Result<()>>,
}

impl Provider {
    /// Create a new provider builder.
    pub fn builder() -> ProviderBuilder {
        ProviderBuilder::new()
    }

    async fn start<R, W>(
        config: ProviderConfig,
        catalog: ErrorCatalog,
        reader: R,
        writer: W,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RtlsEvent>)>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;

        let (writer, writer_task) = spawn_writer_task(
            writer,
            WriterConfig {
                channel_capacity: config.channel_capacity,
            },
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let max_buffered = config.max_buffered;
        let read_buffer_size = config.read_buffer_size.max(1);
        let query_version = config.query_version_on_start;

        let shared = Arc::new(Shared {
            engine: Mutex::new(Engine::new(config, catalog)),
            writer,
            events: events_tx,
            disposed: AtomicBool::new(false),
        });

        let read_task = tokio::spawn(read_loop(
            shared.clone(),
            reader,
            FrameBuffer::with_max_buffered(max_buffered),
            read_buffer_size,
        ));

        let provider = Provider {
            shared,
            read_task,
            writer_task,
        };
        if query_version {
            provider.get_version().await?;
        }
        Ok((provider, events_rx))
    }

    /// Start a search operation.
    ///
    /// # Errors
    ///
    /// `RadioBusy` while another operation runs or stops, `DeviceNotReady`
    /// unless the device is `Idle`, `InvalidParameter` for bad parameters.
    /// A rejected call leaves the stored parameters unchanged.
    pub async fn start_operation(&self, params: OperationParams) -> Result<()> {
        self.shared
            .run(|engine, out| engine.start_operation(params, Instant::now(), out))
            .await
    }

    /// Ask the running operation to stop.
    ///
    /// The provider returns to `Idle` on the next search result or when the
    /// stop timeout elapses. Stopping when nothing runs is a no-op.
    pub async fn stop_operation(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.shared);
        let (armed, settle) = self
            .shared
            .run(move |engine, out| {
                let armed = engine.request_stop(out);
                if armed {
                    let timeout = engine.config().stop_timeout();
                    engine.watchdog.arm(timeout, move |generation| async move {
                        if let Some(shared) = weak.upgrade() {
                            shared.on_watchdog(generation).await;
                        }
                    });
                }
                Ok((armed, engine.config().stop_settle()))
            })
            .await?;

        if armed {
            tracing::debug!("Stop requested, watchdog armed");
            tokio::time::sleep(settle).await;
        }
        Ok(())
    }

    /// Query the firmware version. The answer arrives as
    /// [`RtlsEvent::Version`].
    pub async fn get_version(&self) -> Result<()> {
        self.shared
            .run(|engine, out| {
                out.frames.push(engine.request(MessageId::GetVersion));
                Ok(())
            })
            .await
    }

    pub async fn keep_alive(&self) -> Result<()> {
        self.shared
            .run(|engine, out| {
                out.frames.push(engine.request(MessageId::KeepAlive));
                Ok(())
            })
            .await
    }

    /// Ask `target` to send `count` beacons `interval_ms` apart.
    pub async fn adhoc_beacon(&self, target: DeviceId, count: u8, interval_ms: u16) -> Result<()> {
        if count == 0 {
            return Err(RtlsError::InvalidParameter("beacon count must be non-zero".into()));
        }
        self.shared
            .run(|engine, out| {
                engine.ensure_application()?;
                out.frames.push(engine.command(&AdhocBeaconRequest {
                    target,
                    count,
                    interval_ms,
                }));
                Ok(())
            })
            .await
    }

    /// Blink the LED of `target` `times` times.
    pub async fn led_control(&self, target: DeviceId, times: u8) -> Result<()> {
        self.shared
            .run(|engine, out| {
                engine.ensure_application()?;
                out.frames
                    .push(engine.command(&LedControlRequest { target, times }));
                Ok(())
            })
            .await
    }

    /// User-data control command.
    pub async fn ud_control(&self, flags: u8) -> Result<()> {
        self.shared
            .run(|engine, out| {
                engine.ensure_application()?;
                out.frames.push(engine.command(&UdControlRequest { flags }));
                Ok(())
            })
            .await
    }

    /// Upgrade the anchor firmware from an image file.
    ///
    /// Progress and the final outcome arrive as
    /// [`RtlsEvent::FirmwareProgress`]. Any unfinished session is replaced.
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be read, `InvalidParameter` for an empty or
    /// oversized image, `RadioBusy`/`DeviceNotReady` unless the device is
    /// `Idle` or in its bootloader.
    pub async fn firmware_upgrade(&self, path: impl AsRef<Path>) -> Result<()> {
        self.shared.ensure_open()?;
        let image = Bytes::from(tokio::fs::read(path.as_ref()).await?);
        self.firmware_upgrade_image(image).await
    }

    /// Upgrade the anchor firmware from an in-memory image.
    pub async fn firmware_upgrade_image(&self, image: Bytes) -> Result<()> {
        self.shared
            .run(|engine, out| engine.begin_firmware_upgrade(image, out))
            .await
    }

    pub fn set_select_mask(&self, mask: SelectMask) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared.lock().set_select_mask(mask);
        Ok(())
    }

    pub fn select_mask(&self) -> SelectMask {
        self.shared.lock().select_mask().clone()
    }

    /// # Errors
    ///
    /// Returns `InvalidParameter` above [`MAX_POWER_LEVEL`].
    pub fn set_power_level(&self, level: u8) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared.lock().set_power_level(level)
    }

    pub fn power_level(&self) -> u8 {
        self.shared.lock().power_level()
    }

    pub fn set_back_off(&self, back_off: u8) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared.lock().set_back_off(back_off);
        Ok(())
    }

    pub fn back_off(&self) -> u8 {
        self.shared.lock().back_off()
    }

    /// Current device status.
    pub fn status(&self) -> DeviceStatus {
        self.shared.lock().status()
    }

    /// Last version reported by the device.
    pub fn version(&self) -> Option<VersionInfo> {
        self.shared.lock().version()
    }

    /// Anchor address, broadcast until the device has identified itself.
    pub fn anchor_id(&self) -> DeviceId {
        self.shared.lock().anchor_id()
    }

    /// Parameters of the current or last operation.
    pub fn operation(&self) -> Option<OperationParams> {
        self.shared.lock().params().cloned()
    }

    /// Get the number of frames queued but not yet written.
    pub fn pending_frames(&self) -> usize {
        self.shared.writer.pending_count()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Stop the provider.
    ///
    /// Cancels the watchdog and both tasks. No events are emitted afterwards
    /// and every command returns `NotInitialized`. Calling it again is a
    /// no-op.
    pub async fn shutdown(&self) -> Result<()> {
        self.close();
        Ok(())
    }

    fn close(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.lock().watchdog.disarm();
        self.read_task.abort();
        self.writer_task.abort();
        tracing::debug!("Provider shut down");
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        self.close();
    }
}

/// Main read loop - reads transport bytes and dispatches frames.
async fn read_loop<R>(shared: Arc<Shared>, mut reader: R, mut frame_buffer: FrameBuffer, chunk: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("Transport closed");
                shared.emit(RtlsEvent::TransportClosed);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::error!("Read loop error: {}", e);
                shared.emit(RtlsEvent::TransportError(e.to_string()));
                return;
            }
        };

        for result in frame_buffer.push(&buf[..n]) {
            shared.dispatch(result).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_setters() {
        let builder = ProviderBuilder::new()
            .stop_timeout(Duration::from_secs(2))
            .stop_settle(Duration::from_millis(20))
            .report_interval(Duration::from_millis(500))
            .min_report_samples(4)
            .power_level(12)
            .back_off(3)
            .query_version_on_start(false);

        let config = &builder.config;
        assert_eq!(config.stop_timeout_ms, 2000);
        assert_eq!(config.stop_settle_ms, 20);
        assert_eq!(config.report_interval_ms, 500);
        assert_eq!(config.min_report_samples, 4);
        assert_eq!(config.power_level, 12);
        assert_eq!(config.back_off, 3);
        assert!(!config.query_version_on_start);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let (host, _device) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(host);

        let result = ProviderBuilder::new()
            .power_level(MAX_POWER_LEVEL + 1)
            .start(reader, writer)
            .await;
        assert!(matches!(result, Err(RtlsError::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn test_start_queries_version() {
        let (host, mut device) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(host);
        let (provider, _events) = ProviderBuilder::new().start(reader, writer).await.unwrap();

        let mut buf = vec![0u8; 256];
        let n = tokio::io::AsyncReadExt::read(&mut device, &mut buf).await.unwrap();
        let frames = FrameBuffer::new().push(&buf[..n]);
        let frame = frames[0].as_ref().unwrap();
        assert_eq!(frame.message_id, MessageId::GetVersion);
        assert_eq!(frame.device_id, DeviceId::BROADCAST);

        assert_eq!(provider.status(), DeviceStatus::Unknown);
        assert!(provider.operation().is_none());
    }

    #[tokio::test]
    async fn test_drop_shuts_down() {
        let (host, _device) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(host);
        let (provider, _events) = ProviderBuilder::new()
            .query_version_on_start(false)
            .start(reader, writer)
            .await
            .unwrap();

        let weak = Arc::downgrade(&provider.shared);
        drop(provider);
        tokio::task::yield_now().await;
        assert!(weak.upgrade().map_or(true, |shared| shared.is_disposed()));
    }
}
