//! # Byte Channel
//!
//! Fixed-capacity single-producer/single-consumer byte ring that carries
//! host input into the engine's standard input. The producer never
//! blocks: bytes that do not fit before the write position would collide
//! with the read position are dropped and counted.
//!
//! One slot is always left empty so that `head == tail` means "empty";
//! a channel built with capacity `N` buffers at most `N - 1` bytes.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

/// Callback run after bytes arrive or the channel closes.
pub type NotifyFn = Box<dyn Fn() + Send + Sync>;

/// Channel errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// Nothing buffered and the channel is still open
    WouldBlock,
}

impl core::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ChannelError::WouldBlock => write!(f, "Channel empty, read would block"),
        }
    }
}

struct Ring {
    data: Vec<u8>,
    /// Read position (consumer)
    head: usize,
    /// Write position (producer)
    tail: usize,
}

impl Ring {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn len(&self) -> usize {
        (self.tail + self.capacity() - self.head) % self.capacity()
    }

    /// Moves buffered bytes into `buf`, returning how many were copied.
    fn copy_out(&mut self, buf: &mut [u8]) -> usize {
        let cap = self.capacity();
        let mut n = 0;
        while self.head != self.tail && n < buf.len() {
            buf[n] = self.data[self.head];
            self.head = (self.head + 1) % cap;
            n += 1;
        }
        n
    }
}

/// Bounded wraparound byte queue between a host writer and the engine.
pub struct ByteChannel {
    ring: Mutex<Ring>,
    closed: AtomicBool,
    bytes_dropped: AtomicU64,
    bytes_written: AtomicU64,
    notify: Mutex<Option<NotifyFn>>,
}

impl ByteChannel {
    /// Creates a channel with `capacity` slots (at least 2).
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                data: vec![0u8; capacity.max(2)],
                head: 0,
                tail: 0,
            }),
            closed: AtomicBool::new(false),
            bytes_dropped: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            notify: Mutex::new(None),
        }
    }

    /// Copies as many bytes as fit; the rest are dropped.
    ///
    /// Returns the number of bytes accepted. Pushing to a closed channel
    /// accepts nothing and is not counted as a drop.
    pub fn push(&self, bytes: &[u8]) -> usize {
        if self.is_closed() || bytes.is_empty() {
            return 0;
        }

        let accepted = {
            let mut ring = self.ring.lock();
            let cap = ring.capacity();
            let mut tail = ring.tail;
            let mut written = 0;
            for &b in bytes {
                let next = (tail + 1) % cap;
                if next == ring.head {
                    break;
                }
                ring.data[tail] = b;
                tail = next;
                written += 1;
            }
            ring.tail = tail;
            written
        };

        let dropped = bytes.len() - accepted;
        if dropped > 0 {
            self.bytes_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            log::warn!("byte channel full, dropped {} of {} bytes", dropped, bytes.len());
        }
        if accepted > 0 {
            self.bytes_written.fetch_add(accepted as u64, Ordering::Relaxed);
            self.wake();
        }
        accepted
    }

    /// Reads up to `max` bytes.
    ///
    /// An empty result means end of stream (closed and drained). Asking
    /// for zero bytes is always `WouldBlock`.
    pub fn read(&self, max: usize) -> Result<Vec<u8>, ChannelError> {
        if max == 0 {
            return Err(ChannelError::WouldBlock);
        }
        let mut ring = self.ring.lock();
        if ring.head == ring.tail {
            return self.empty_result().map(|_| Vec::new());
        }
        let mut out = vec![0u8; max.min(ring.len())];
        let n = ring.copy_out(&mut out);
        out.truncate(n);
        Ok(out)
    }

    /// Reads into `buf`, returning the number of bytes copied.
    ///
    /// `Ok(0)` means end of stream. An empty `buf` is always `WouldBlock`.
    pub fn read_into(&self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        if buf.is_empty() {
            return Err(ChannelError::WouldBlock);
        }
        let mut ring = self.ring.lock();
        if ring.head == ring.tail {
            return self.empty_result();
        }
        Ok(ring.copy_out(buf))
    }

    fn empty_result(&self) -> Result<usize, ChannelError> {
        if self.is_closed() {
            Ok(0)
        } else {
            Err(ChannelError::WouldBlock)
        }
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when a read would not block: data is buffered or the channel
    /// has closed.
    pub fn is_readable(&self) -> bool {
        self.is_closed() || !self.is_empty()
    }

    /// Total slots, including the one kept free.
    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks end of stream. Buffered bytes stay readable.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.wake();
        }
    }

    /// Bytes rejected because the ring was full.
    pub fn bytes_dropped(&self) -> u64 {
        self.bytes_dropped.load(Ordering::Relaxed)
    }

    /// Bytes accepted over the channel's lifetime.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Installs the callback run when data arrives or the channel closes.
    pub fn set_notify(&self, notify: NotifyFn) {
        *self.notify.lock() = Some(notify);
    }

    pub fn clear_notify(&self) {
        *self.notify.lock() = None;
    }

    fn wake(&self) {
        if let Some(notify) = self.notify.lock().as_ref() {
            notify();
        }
    }
}
