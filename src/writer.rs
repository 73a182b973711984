//! Dedicated writer task for outbound frames.
//!
//! Commands are issued from caller tasks, from the read loop (retries,
//! follow-up blocks) and from the stop watchdog. All of them hand encoded
//! frames to a single writer task over an mpsc channel, so frames reach the
//! wire whole and in the order they were queued.
//!
//! # Architecture
//!
//! ```text
//! Command API ─┐
//! Read loop   ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Transport
//! Watchdog    ─┘
//! ```
//!
//! Frames that are already queued when the task wakes are written in one
//! vectored write.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, RtlsError};
use crate::protocol::{Frame, MessageId};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame encoded as wire text, ready to be written.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Message id, kept for logging.
    pub message_id: MessageId,
    /// `@RTL` + hex body + `$END`.
    pub wire: Bytes,
}

impl OutboundFrame {
    /// Encode a frame for sending.
    pub fn new(frame: &Frame) -> Result<Self> {
        Ok(Self {
            message_id: frame.message_id,
            wire: Bytes::from(frame.encode()?),
        })
    }

    /// Size on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.wire.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    /// Frames queued but not yet written.
    pending: Arc<AtomicUsize>,
}

impl WriterHandle {
    fn new(tx: mpsc::Sender<OutboundFrame>, pending: Arc<AtomicUsize>) -> Self {
        Self { tx, pending }
    }

    /// Queue a frame, waiting while the channel is full.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` once the writer task has stopped.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            RtlsError::ConnectionClosed
        })
    }

    /// Get the number of frames queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends cleanly when every handle is dropped, or with an error
/// when the transport write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(tx, pending.clone());
    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

/// Receives frames and writes them to the transport.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => return Ok(()),
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::error!("Transport write error: {}", e);
            return Err(e);
        }
        for frame in &batch {
            tracing::debug!(message_id = ?frame.message_id, bytes = frame.size(), "Frame written");
        }

        pending.fetch_sub(batch_size, Ordering::Release);
    }
}

/// Write a batch of frames with vectored writes, resuming after short writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(RtlsError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data after `skip_bytes`.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let end = offset + frame.size();
        if skip_bytes < end {
            let start_in_frame = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame.wire[start_in_frame..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeviceId;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    fn frame(payload: &'static [u8]) -> OutboundFrame {
        OutboundFrame::new(&Frame::command(
            DeviceId::BROADCAST,
            MessageId::KeepAlive,
            Bytes::from_static(payload),
        ))
        .unwrap()
    }

    #[test]
    fn test_outbound_frame_is_wire_text() {
        let out = frame(b"\x01");
        assert!(out.wire.starts_with(b"@RTL"));
        assert!(out.wire.ends_with(b"$END"));
        assert_eq!(out.message_id, MessageId::KeepAlive);
    }

    #[test]
    fn test_build_remaining_slices_mid_frame() {
        let batch = vec![frame(b""), frame(b"\x02")];
        let first = batch[0].size();

        let slices = build_remaining_slices(&batch, 3);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), first - 3);

        let slices = build_remaining_slices(&batch, first);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), batch[1].size());
    }

    #[tokio::test]
    async fn test_write_batch_preserves_order() {
        let mut buf = Cursor::new(Vec::new());
        let batch = vec![frame(b"\x01"), frame(b"\x02")];

        write_batch(&mut buf, &batch).await.unwrap();

        let mut expected = batch[0].wire.to_vec();
        expected.extend_from_slice(&batch[1].wire);
        assert_eq!(buf.into_inner(), expected);
    }

    #[tokio::test]
    async fn test_writer_task_delivers_frames() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        let out = frame(b"\xAA");
        let expected = out.wire.clone();
        handle.send(out).await.unwrap();

        let mut buf = vec![0u8; expected.len()];
        tokio::time::timeout(Duration::from_secs(1), server.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_send_after_writer_stopped() {
        let (client, server) = duplex(64);
        drop(server);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        handle.send(frame(b"")).await.unwrap();
        assert!(task.await.unwrap().is_err());
        assert!(matches!(
            handle.send(frame(b"")).await,
            Err(RtlsError::ConnectionClosed)
        ));
    }
}
