//! Bounded blocking byte ring buffer.
//!
//! Sits between a blocking transport receive thread and the consumer that
//! drains it. One writer and one reader may run concurrently: the writer
//! blocks while the buffer is full, the reader waits (with a timeout) while
//! it is empty. [`RingBuffer::close`] releases both.
//!
//! Copies move at most two contiguous segments per call, so a write that
//! straddles the end of the storage wraps to the front.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use rtls_provider::RingBuffer;
//!
//! let ring = RingBuffer::new(8).unwrap();
//! assert_eq!(ring.write(b"@RTL").unwrap(), 4);
//!
//! let mut out = [0u8; 8];
//! let n = ring.read(&mut out, Duration::from_millis(10)).unwrap();
//! assert_eq!(&out[..n], b"@RTL");
//! assert!(ring.is_empty());
//! ```

use std::io;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{Result, RtlsError};

/// Storage and cursors, guarded by the buffer's mutex.
struct Inner {
    storage: Box<[u8]>,
    /// Next index to read.
    head: usize,
    /// Next index to write.
    tail: usize,
    count: usize,
    closed: bool,
}

impl Inner {
    fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn push(&mut self, data: &[u8]) -> usize {
        let capacity = self.capacity();
        let n = data.len().min(capacity - self.count);
        let first = n.min(capacity - self.tail);

        self.storage[self.tail..self.tail + first].copy_from_slice(&data[..first]);
        self.storage[..n - first].copy_from_slice(&data[first..n]);

        self.tail = (self.tail + n) % capacity;
        self.count += n;
        n
    }

    fn pop(&mut self, out: &mut [u8]) -> usize {
        let capacity = self.capacity();
        let n = out.len().min(self.count);
        let first = n.min(capacity - self.head);

        out[..first].copy_from_slice(&self.storage[self.head..self.head + first]);
        out[first..n].copy_from_slice(&self.storage[..n - first]);

        self.head = (self.head + n) % capacity;
        self.count -= n;
        n
    }
}

/// Fixed-capacity circular byte buffer with blocking reads and writes.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    has_data: Condvar,
    has_space: Condvar,
}

impl RingBuffer {
    /// Create a buffer holding up to `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` for a zero capacity.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(RtlsError::InvalidParameter(
                "ring buffer capacity must be non-zero".into(),
            ));
        }

        Ok(Self {
            inner: Mutex::new(Inner {
                storage: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                tail: 0,
                count: 0,
                closed: false,
            }),
            has_data: Condvar::new(),
            has_space: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write as many bytes of `data` as currently fit.
    ///
    /// Blocks until at least one byte of space is free. Returns the number
    /// of bytes copied, which may be less than `data.len()`.
    ///
    /// # Errors
    ///
    /// Returns `BufferClosed` once [`close`](Self::close) has been called,
    /// including while blocked.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut inner = self.lock();
        loop {
            if inner.closed {
                return Err(RtlsError::BufferClosed);
            }
            if data.is_empty() {
                return Ok(0);
            }
            if inner.count < inner.capacity() {
                break;
            }
            inner = self
                .has_space
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let n = inner.push(data);
        drop(inner);
        self.has_data.notify_all();
        Ok(n)
    }

    /// Write a single byte, blocking while the buffer is full.
    pub fn write_byte(&self, byte: u8) -> Result<()> {
        self.write(&[byte]).map(|_| ())
    }

    /// Read up to `out.len()` bytes, waiting at most `timeout` for data.
    ///
    /// Returns `0` when the timeout elapses with the buffer still empty.
    ///
    /// # Errors
    ///
    /// Returns `BufferClosed` once the buffer has been closed.
    pub fn read(&self, out: &mut [u8], timeout: Duration) -> Result<usize> {
        self.read_until(out, Some(Instant::now() + timeout))
    }

    /// Read one byte, waiting at most `timeout`.
    pub fn read_byte(&self, timeout: Duration) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte, timeout)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    fn read_until(&self, out: &mut [u8], deadline: Option<Instant>) -> Result<usize> {
        let mut inner = self.lock();
        loop {
            if inner.closed {
                return Err(RtlsError::BufferClosed);
            }
            if out.is_empty() {
                return Ok(0);
            }
            if inner.count > 0 {
                break;
            }
            inner = match deadline {
                None => self
                    .has_data
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(0);
                    }
                    self.has_data
                        .wait_timeout(inner, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0)
                }
            };
        }

        let n = inner.pop(out);
        drop(inner);
        self.has_space.notify_all();
        Ok(n)
    }

    /// Discard all buffered bytes. Capacity is unchanged.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.head = 0;
        inner.tail = 0;
        inner.count = 0;
        drop(inner);
        self.has_space.notify_all();
    }

    /// Close the buffer and wake every waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.has_data.notify_all();
        self.has_space.notify_all();
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.lock().count
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        let inner = self.lock();
        inner.count == inner.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Blocking read; a closed buffer reads as end of stream.
impl io::Read for &RingBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.read_until(buf, None) {
            Ok(n) => Ok(n),
            Err(RtlsError::BufferClosed) => Ok(0),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

impl io::Write for &RingBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        RingBuffer::write(*self, buf).map_err(|e| match e {
            RtlsError::BufferClosed => io::Error::new(io::ErrorKind::BrokenPipe, e),
            other => io::Error::new(io::ErrorKind::Other, other),
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::Arc;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            RingBuffer::new(0),
            Err(RtlsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_partial_write_when_nearly_full() {
        let ring = RingBuffer::new(4).unwrap();
        assert_eq!(ring.write(b"abc").unwrap(), 3);
        assert_eq!(ring.write(b"xyz").unwrap(), 1);
        assert!(ring.is_full());
        assert_eq!(ring.len(), ring.capacity());
    }

    #[test]
    fn test_wrap_around() {
        let ring = RingBuffer::new(5).unwrap();
        let mut out = [0u8; 5];

        ring.write(b"abcd").unwrap();
        assert_eq!(ring.read(&mut out[..3], SHORT).unwrap(), 3);
        assert_eq!(&out[..3], b"abc");

        // Tail wraps past the end of storage.
        assert_eq!(ring.write(b"efgh").unwrap(), 4);
        assert!(ring.is_full());

        let n = ring.read(&mut out, SHORT).unwrap();
        assert_eq!(&out[..n], b"defgh");
        assert!(ring.is_empty());
    }

    #[test]
    fn test_read_timeout_returns_zero() {
        let ring = RingBuffer::new(4).unwrap();
        let mut out = [0u8; 4];
        let start = Instant::now();
        assert_eq!(ring.read(&mut out, SHORT).unwrap(), 0);
        assert!(start.elapsed() >= SHORT);
        assert_eq!(ring.read_byte(SHORT).unwrap(), None);
    }

    #[test]
    fn test_byte_helpers() {
        let ring = RingBuffer::new(2).unwrap();
        ring.write_byte(0xA5).unwrap();
        assert_eq!(ring.read_byte(SHORT).unwrap(), Some(0xA5));
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let ring = RingBuffer::new(3).unwrap();
        ring.write(b"abc").unwrap();
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.capacity(), 3);
        assert_eq!(ring.write(b"xyz").unwrap(), 3);
    }

    #[test]
    fn test_close_fails_later_operations() {
        let ring = RingBuffer::new(3).unwrap();
        ring.write(b"a").unwrap();
        ring.close();

        assert!(ring.is_closed());
        assert!(matches!(ring.write(b"b"), Err(RtlsError::BufferClosed)));
        assert!(matches!(
            ring.read_byte(SHORT),
            Err(RtlsError::BufferClosed)
        ));
    }

    #[test]
    fn test_close_releases_blocked_writer() {
        let ring = Arc::new(RingBuffer::new(2).unwrap());
        ring.write(b"xx").unwrap();

        let writer = {
            let ring = ring.clone();
            thread::spawn(move || ring.write(b"y"))
        };

        thread::sleep(SHORT);
        ring.close();
        assert!(matches!(
            writer.join().unwrap(),
            Err(RtlsError::BufferClosed)
        ));
    }

    #[test]
    fn test_close_releases_blocked_io_reader() {
        let ring = Arc::new(RingBuffer::new(2).unwrap());

        let reader = {
            let ring = ring.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 2];
                Read::read(&mut &*ring, &mut buf).unwrap()
            })
        };

        thread::sleep(SHORT);
        ring.close();
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_transfer_conserves_bytes() {
        let ring = Arc::new(RingBuffer::new(7).unwrap());
        let input: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let producer = {
            let ring = ring.clone();
            let input = input.clone();
            thread::spawn(move || (&*ring).write_all(&input).unwrap())
        };

        let mut output = Vec::with_capacity(input.len());
        let mut chunk = [0u8; 5];
        while output.len() < input.len() {
            let n = ring.read(&mut chunk, Duration::from_secs(5)).unwrap();
            assert!(n > 0, "reader starved");
            assert!(ring.len() <= ring.capacity());
            output.extend_from_slice(&chunk[..n]);
        }

        producer.join().unwrap();
        assert_eq!(output, input);
        assert!(ring.is_empty());
    }
}
