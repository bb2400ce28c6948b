//! # Bounded Byte Ring Buffer
//!
//! This module provides the fixed-capacity byte queue that sits between the
//! bursty producer (receive callback) and the draining consumer task.
//!
//! ## Design Principles
//!
//! 1. **Fixed Capacity**: Storage is allocated once at construction and never
//!    grows, which bounds both memory use and worst-case latency.
//!
//! 2. **Non-Blocking Writes**: `try_write` either copies the whole slice or
//!    nothing at all, and never waits. It is safe to call from a
//!    time-critical callback.
//!
//! 3. **Zero-Copy Reads**: The consumer borrows a [`Chunk`] that points
//!    straight into buffer memory and hands it to the sink. Space is only
//!    reclaimed when the chunk is released.
//!
//! 4. **Byte Semantics**: No message boundaries survive. A single write can be
//!    read back as several chunks and several writes can come out as one.
//!
//! ## Memory Layout
//!
//! ```text
//! ┌──────────┬───────────────────────┬──────────────────────────┐
//! │   free   │   readable (chunk)    │          free            │
//! └──────────┴───────────────────────┴──────────────────────────┘
//!            ▲                       ▲
//!      read_idx mod C          write_idx mod C
//! ```
//!
//! Both cursors run over `[0, 2C)` and wrap there, so a full buffer
//! (`write_idx - read_idx == C`) is told apart from an empty one and every one
//! of the `C` bytes is usable. Wrapping at `2C` instead of at `usize::MAX`
//! keeps the storage position in step for any capacity.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

/// Default capacity: 42KB holds roughly one storage write stall worth of
/// incoming PCM plus margin.
pub const DEFAULT_CAPACITY: usize = 42 * 1024;

/// Errors specific to buffer operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferError {
    /// Not enough free space for the whole write
    #[error("not enough free space for the write")]
    Overflow,
    /// Another writer currently holds the write side
    #[error("another writer is active on this buffer")]
    Busy,
    /// A buffer must hold at least one byte
    #[error("buffer capacity must be non-zero")]
    ZeroCapacity,
    /// Storage allocation failed
    #[error("failed to allocate {0} bytes of buffer storage")]
    Allocation(usize),
}

/// Single-producer single-consumer byte ring buffer
///
/// # Thread Safety
///
/// Cursors are atomics published with Release/Acquire ordering. The write and
/// read sides are each guarded by a claim flag that is taken without
/// waiting: a second concurrent writer gets [`BufferError::Busy`] and a second
/// reader sees no data, so misuse degrades instead of corrupting memory.
///
/// # Example
///
/// ```rust
/// use pcm_flow::buffer::RingBuffer;
///
/// let buffer = RingBuffer::new(16).unwrap();
///
/// // Producer: all-or-nothing write
/// buffer.try_write(b"hello").unwrap();
/// assert_eq!(buffer.occupancy(), 5);
///
/// // Consumer: borrow, forward, release
/// let chunk = buffer.try_read_upto(8).unwrap();
/// assert_eq!(&chunk[..], b"hello");
/// chunk.release();
/// assert!(buffer.is_empty());
/// ```
pub struct RingBuffer {
    /// Backing storage, shared between the two sides through raw pointers
    storage: Box<[UnsafeCell<u8>]>,

    /// Write cursor in `[0, 2C)` (producer owned)
    write_idx: AtomicUsize,

    /// Read cursor in `[0, 2C)` (consumer owned)
    read_idx: AtomicUsize,

    /// Set while a write is copying into storage
    writing: AtomicBool,

    /// Set while a [`Chunk`] is outstanding
    reading: AtomicBool,

    /// Wakes a reader parked in `read_upto`
    readable: Notify,
}

// SAFETY: the writer only touches the free region `[write_idx, read_idx + C)`
// and the reader only the readable region `[read_idx, write_idx)`. The claim
// flags keep each side to a single actor at a time.
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Allocate a buffer holding exactly `capacity` bytes
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        if capacity > isize::MAX as usize / 2 {
            return Err(BufferError::Allocation(capacity));
        }

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| BufferError::Allocation(capacity))?;
        storage.resize_with(capacity, || UnsafeCell::new(0u8));

        Ok(Self {
            storage: storage.into_boxed_slice(),
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(0),
            writing: AtomicBool::new(false),
            reading: AtomicBool::new(false),
            readable: Notify::new(),
        })
    }

    /// Get the total capacity of the buffer
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of bytes currently held
    ///
    /// This is a gauge: with both sides running it may already be stale when
    /// it returns. It never exceeds the capacity.
    #[inline]
    pub fn occupancy(&self) -> usize {
        // Read cursor first: the write cursor can only have moved forward since.
        let read = self.read_idx.load(Ordering::Acquire);
        let write = self.write_idx.load(Ordering::Acquire);
        self.distance(read, write).min(self.capacity())
    }

    /// Number of bytes that can currently be written
    #[inline]
    pub fn free(&self) -> usize {
        self.capacity() - self.occupancy()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.occupancy() == self.capacity()
    }

    /// Bytes from cursor `from` forward to cursor `to`
    #[inline]
    fn distance(&self, from: usize, to: usize) -> usize {
        if to >= from {
            to - from
        } else {
            to + (2 * self.capacity() - from)
        }
    }

    /// Move a cursor `len` bytes forward, wrapping at `2C`
    #[inline]
    fn advance(&self, idx: usize, len: usize) -> usize {
        let left = 2 * self.capacity() - idx;
        if len >= left {
            len - left
        } else {
            idx + len
        }
    }

    /// Storage position of a cursor
    #[inline]
    fn position(&self, idx: usize) -> usize {
        let capacity = self.capacity();
        if idx >= capacity {
            idx - capacity
        } else {
            idx
        }
    }

    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.storage.as_ptr())
    }

    /// Copy all of `data` into the buffer, or nothing
    ///
    /// Never blocks. Fails with [`BufferError::Overflow`] when free space is
    /// smaller than `data.len()`; the buffer is left untouched in that case.
    pub fn try_write(&self, data: &[u8]) -> Result<(), BufferError> {
        if self.writing.swap(true, Ordering::Acquire) {
            return Err(BufferError::Busy);
        }
        let result = self.write_claimed(data);
        self.writing.store(false, Ordering::Release);

        if result.is_ok() && !data.is_empty() {
            self.readable.notify_one();
        }
        result
    }

    fn write_claimed(&self, data: &[u8]) -> Result<(), BufferError> {
        let capacity = self.capacity();
        let write = self.write_idx.load(Ordering::Relaxed);
        let read = self.read_idx.load(Ordering::Acquire);
        let free = capacity - self.distance(read, write);

        if data.len() > free {
            return Err(BufferError::Overflow);
        }
        if data.is_empty() {
            return Ok(());
        }

        let pos = self.position(write);
        let first_len = data.len().min(capacity - pos);

        // SAFETY: `data.len() <= free`, so both destination ranges lie in the
        // free region which the reader never touches, and we hold the write
        // claim.
        unsafe {
            let base = self.base_ptr();
            ptr::copy_nonoverlapping(data.as_ptr(), base.add(pos), first_len);
            ptr::copy_nonoverlapping(
                data.as_ptr().add(first_len),
                base,
                data.len() - first_len,
            );
        }

        self.write_idx
            .store(self.advance(write, data.len()), Ordering::Release);
        Ok(())
    }

    /// Borrow up to `max_len` readable bytes without waiting
    ///
    /// The view is contiguous, so near the end of storage it may be shorter
    /// than what is readable; the rest comes with the next read.
    ///
    /// # Returns
    /// - `Some(Chunk)` if data is available
    /// - `None` if the buffer is empty, `max_len` is zero, or a previous
    ///   chunk has not been released yet
    pub fn try_read_upto(&self, max_len: usize) -> Option<Chunk<'_>> {
        if max_len == 0 || self.reading.swap(true, Ordering::Acquire) {
            return None;
        }

        let capacity = self.capacity();
        let read = self.read_idx.load(Ordering::Relaxed);
        let write = self.write_idx.load(Ordering::Acquire);
        let available = self.distance(read, write);

        if available == 0 {
            self.reading.store(false, Ordering::Release);
            return None;
        }

        let pos = self.position(read);
        let len = max_len.min(available).min(capacity - pos);

        // SAFETY: `[pos, pos + len)` is inside storage and inside the readable
        // region, which the writer will not touch until the read cursor moves.
        let data = unsafe { slice::from_raw_parts(self.base_ptr().add(pos), len) };

        Some(Chunk { buffer: self, data })
    }

    /// Wait up to `timeout` for data, then borrow up to `max_len` bytes
    ///
    /// Returns `None` if nothing arrived before the deadline.
    pub async fn read_upto(&self, max_len: usize, timeout: Duration) -> Option<Chunk<'_>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(chunk) = self.try_read_upto(max_len) {
                return Some(chunk);
            }
            // A notify that lands between the check above and this await is
            // kept as a permit, so no wakeup is lost.
            if time::timeout_at(deadline, self.readable.notified())
                .await
                .is_err()
            {
                return self.try_read_upto(max_len);
            }
        }
    }

    /// Return a chunk, freeing its bytes for future writes
    ///
    /// Equivalent to [`Chunk::release`].
    pub fn release(&self, chunk: Chunk<'_>) {
        debug_assert!(ptr::eq(chunk.buffer, self), "chunk from another buffer");
        drop(chunk);
    }

    fn advance_read(&self, len: usize) {
        let read = self.read_idx.load(Ordering::Relaxed);
        self.read_idx
            .store(self.advance(read, len), Ordering::Release);
        self.reading.store(false, Ordering::Release);
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("occupancy", &self.occupancy())
            .finish()
    }
}

/// A borrowed, contiguous view of buffered bytes
///
/// The bytes stay reserved until the chunk is released, either explicitly
/// with [`Chunk::release`] or implicitly when it is dropped. Releasing on
/// drop means a failed forward can never leak buffer space.
pub struct Chunk<'a> {
    buffer: &'a RingBuffer,
    data: &'a [u8],
}

impl Chunk<'_> {
    /// The borrowed bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.data
    }

    /// Free the chunk's bytes in the buffer
    pub fn release(self) {}
}

impl Deref for Chunk<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

impl Drop for Chunk<'_> {
    fn drop(&mut self) {
        self.buffer.advance_read(self.data.len());
    }
}

impl fmt::Debug for Chunk<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk").field("len", &self.data.len()).finish()
    }
}
