//! Ring Buffer Channel.
//!
//! A fixed-capacity byte ring shared by exactly one producer and one
//! consumer. Offsets are absolute positions inside the region, so a cursor
//! always lies in `header_size..capacity`.
//!
//! ```text
//! 0              header_size                                    capacity
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ header       │ payload (circular)                           │
//! │ cursor words │  ◄── consumed ....... cursor ──►             │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! The producer cursor is published with `Release` after the bytes it covers
//! have been copied, and observed with `Acquire` by the consumer. The consumer
//! publishes how far it has read the same way, which lets the producer refuse
//! writes that would lap unread bytes instead of silently overwriting them.
//! One payload byte always stays free so that `cursor == consumed` means empty.
//!
//! Endpoints come from [`RingChannel::pair`]. Neither [`RingWriter`] nor
//! [`RingReader`] is `Clone`, which keeps the single-producer/single-consumer
//! roles fixed for the lifetime of the channel.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Default size of the whole region in bytes.
pub const DEFAULT_CAPACITY: u32 = 4096;

/// Default number of bytes reserved for the header.
pub const DEFAULT_HEADER_SIZE: u32 = 3;

/// Largest region a 16-bit cursor can address.
pub const MAX_CAPACITY: u32 = 1 << 16;

/// Geometry of a ring channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingConfig {
    /// Total size of the region, header included.
    pub capacity: u32,
    /// Bytes reserved at the start of the region for the cursor words.
    pub header_size: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            header_size: DEFAULT_HEADER_SIZE,
        }
    }
}

impl RingConfig {
    pub fn new(capacity: u32, header_size: u32) -> Self {
        Self {
            capacity,
            header_size,
        }
    }

    /// Number of payload bytes (`capacity - header_size`).
    pub fn payload_len(&self) -> usize {
        self.capacity.saturating_sub(self.header_size) as usize
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.capacity > MAX_CAPACITY {
            return Err(LayoutError::CapacityTooLarge {
                capacity: self.capacity,
                max: MAX_CAPACITY,
            });
        }
        if self.header_size == 0 {
            return Err(LayoutError::EmptyHeader);
        }
        if self.payload_len() < 2 {
            return Err(LayoutError::PayloadTooSmall {
                capacity: self.capacity,
                header_size: self.header_size,
            });
        }
        Ok(())
    }
}

/// Invalid ring geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("capacity {capacity} exceeds the 16-bit cursor range (max {max})")]
    CapacityTooLarge { capacity: u32, max: u32 },

    #[error("header size must be at least one byte")]
    EmptyHeader,

    #[error("capacity {capacity} leaves fewer than 2 payload bytes after a {header_size}-byte header")]
    PayloadTooSmall { capacity: u32, header_size: u32 },
}

/// Errors reported by the producer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// The write would lap bytes the consumer has not read yet.
    #[error("ring overflow: {requested} bytes requested, {free} free")]
    Overflow { requested: usize, free: usize },
}

/// Cursor words at the front of the region.
#[repr(C)]
struct RingHeader {
    /// Next offset the producer will fill.
    cursor: AtomicU16,
    /// First offset the consumer has not read yet.
    consumed: AtomicU16,
}

/// The shared region. Only reachable through a [`RingWriter`]/[`RingReader`]
/// pair, or read-only through [`RingWriter::channel`]/[`RingReader::channel`].
pub struct RingChannel {
    header: RingHeader,
    cells: Box<[UnsafeCell<u8>]>,
    header_size: usize,
    capacity: usize,
}

// SAFETY: the producer only writes cells in `cursor..consumed` (modulo wrap)
// and the consumer only reads cells in `consumed..cursor`. Both ranges are
// handed over through acquire/release stores of the cursor words, so no cell
// is ever accessed by both sides at once.
unsafe impl Sync for RingChannel {}
unsafe impl Send for RingChannel {}

impl fmt::Debug for RingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingChannel")
            .field("capacity", &self.capacity)
            .field("header_size", &self.header_size)
            .field("cursor", &self.cursor())
            .field("consumed", &self.header.consumed.load(Ordering::Relaxed))
            .finish()
    }
}

impl RingChannel {
    /// Allocate a channel and split it into its two endpoints.
    ///
    /// Both cursors start at `header_size`.
    pub fn pair(config: RingConfig) -> Result<(RingWriter, RingReader), LayoutError> {
        config.validate()?;

        let header_size = config.header_size as usize;
        let capacity = config.capacity as usize;
        let start = header_size as u16;

        let ring = Arc::new(RingChannel {
            header: RingHeader {
                cursor: AtomicU16::new(start),
                consumed: AtomicU16::new(start),
            },
            cells: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
            header_size,
            capacity,
        });

        let writer = RingWriter { ring: ring.clone() };
        let reader = RingReader {
            ring,
            cursor: start,
        };
        Ok((writer, reader))
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn header_size(&self) -> usize {
        self.header_size
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.capacity - self.header_size
    }

    /// Current producer cursor.
    #[inline]
    pub fn cursor(&self) -> u16 {
        self.header.cursor.load(Ordering::Acquire)
    }

    /// Number of unread bytes for a reader positioned at `read_cursor`.
    ///
    /// `(cursor - read_cursor) mod (capacity - header_size)`, which also covers
    /// a producer that has wrapped past the reader.
    #[inline]
    pub fn peek_available(&self, read_cursor: u16) -> usize {
        self.distance(read_cursor as usize, self.cursor() as usize)
    }

    #[inline]
    fn distance(&self, from: usize, to: usize) -> usize {
        debug_assert!(self.contains(from) && self.contains(to));
        let payload = self.payload_len();
        (to + payload - from) % payload
    }

    #[inline]
    fn contains(&self, offset: usize) -> bool {
        offset >= self.header_size && offset < self.capacity
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.cells.as_ptr())
    }

    /// Producer-side free space, keeping one byte in reserve.
    fn free_space(&self) -> usize {
        let consumed = self.header.consumed.load(Ordering::Acquire) as usize;
        let cursor = self.header.cursor.load(Ordering::Relaxed) as usize;
        self.payload_len() - 1 - self.distance(consumed, cursor)
    }

    /// Copy `bytes` in at the producer cursor, wrapping to `header_size` at
    /// `capacity`, then publish the new cursor.
    ///
    /// Caller must be the unique producer.
    fn push(&self, bytes: &[u8]) -> Result<(), RingError> {
        let free = self.free_space();
        if bytes.len() > free {
            return Err(RingError::Overflow {
                requested: bytes.len(),
                free,
            });
        }

        let mut cursor = self.header.cursor.load(Ordering::Relaxed) as usize;
        let mut written = 0;
        // At most two segments: bytes.len() < payload_len.
        while written < bytes.len() {
            let run = (bytes.len() - written).min(self.capacity - cursor);
            // SAFETY: `cursor..cursor + run` lies inside the region and inside
            // the free range checked above; the consumer does not touch it.
            unsafe {
                ptr::copy_nonoverlapping(bytes.as_ptr().add(written), self.base().add(cursor), run);
            }
            written += run;
            cursor += run;
            if cursor == self.capacity {
                cursor = self.header_size;
            }
        }

        self.header.cursor.store(cursor as u16, Ordering::Release);
        Ok(())
    }

    /// Copy up to `max_len` unread bytes starting at `read_cursor` into `out`.
    /// Returns the reader cursor that follows the copied bytes.
    ///
    /// Caller must be the unique consumer and `read_cursor` must not be behind
    /// the published consumed position.
    fn drain_into(&self, read_cursor: u16, max_len: usize, out: &mut Vec<u8>) -> u16 {
        let mut offset = read_cursor as usize;
        let mut remaining = self.distance(offset, self.cursor() as usize).min(max_len);
        out.reserve(remaining);

        while remaining > 0 {
            let run = remaining.min(self.capacity - offset);
            // SAFETY: `offset..offset + run` was published by the producer
            // (acquire load above) and is not reusable until we publish
            // `consumed` past it.
            let segment = unsafe { std::slice::from_raw_parts(self.base().add(offset), run) };
            out.extend_from_slice(segment);
            remaining -= run;
            offset += run;
            if offset == self.capacity {
                offset = self.header_size;
            }
        }

        offset as u16
    }

    #[cfg(test)]
    fn byte_at(&self, offset: usize) -> u8 {
        // SAFETY: test-only peek at a quiescent ring.
        unsafe { *self.base().add(offset) }
    }
}

/// Producer endpoint.
#[derive(Debug)]
pub struct RingWriter {
    ring: Arc<RingChannel>,
}

impl RingWriter {
    /// Push all of `bytes` or nothing.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), RingError> {
        self.ring.push(bytes)
    }

    /// Bytes that can be pushed right now without lapping the reader.
    pub fn free_space(&self) -> usize {
        self.ring.free_space()
    }

    pub fn cursor(&self) -> u16 {
        self.ring.cursor()
    }

    pub fn channel(&self) -> &RingChannel {
        &self.ring
    }
}

/// Consumer endpoint. Owns the local read cursor.
#[derive(Debug)]
pub struct RingReader {
    ring: Arc<RingChannel>,
    cursor: u16,
}

impl RingReader {
    /// Local read cursor.
    pub fn cursor(&self) -> u16 {
        self.cursor
    }

    /// Unread bytes.
    pub fn available(&self) -> usize {
        self.ring.peek_available(self.cursor)
    }

    /// Take up to `max_len` unread bytes.
    pub fn drain(&mut self, max_len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        self.drain_into(&mut out, max_len);
        out
    }

    /// Append up to `max_len` unread bytes to `out`, returning how many.
    pub fn drain_into(&mut self, out: &mut Vec<u8>, max_len: usize) -> usize {
        let before = out.len();
        let next = self.ring.drain_into(self.cursor, max_len, out);
        self.commit(next);
        out.len() - before
    }

    /// Jump to the producer cursor, discarding everything unread.
    /// Returns the number of bytes skipped.
    pub fn skip_to_producer(&mut self) -> usize {
        let producer = self.ring.cursor();
        let skipped = self.ring.distance(self.cursor as usize, producer as usize);
        self.commit(producer);
        skipped
    }

    pub fn channel(&self) -> &RingChannel {
        &self.ring
    }

    fn commit(&mut self, next: u16) {
        self.cursor = next;
        self.ring.header.consumed.store(next, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> RingConfig {
        // 13 payload bytes
        RingConfig::new(16, 3)
    }

    #[test]
    fn test_push_and_drain() {
        let (mut tx, mut rx) = RingChannel::pair(small()).unwrap();

        tx.push(b"hello").unwrap();
        assert_eq!(rx.available(), 5);
        assert_eq!(rx.drain(usize::MAX), b"hello");
        assert_eq!(rx.available(), 0);
        assert_eq!(rx.cursor(), 8);
    }

    #[test]
    fn test_partial_drain_keeps_rest() {
        let (mut tx, mut rx) = RingChannel::pair(small()).unwrap();

        tx.push(b"abcdef").unwrap();
        assert_eq!(rx.drain(4), b"abcd");
        assert_eq!(rx.available(), 2);
        assert_eq!(rx.drain(4), b"ef");
    }

    #[test]
    fn test_cursors_start_at_header() {
        let (tx, rx) = RingChannel::pair(RingConfig::default()).unwrap();
        assert_eq!(tx.cursor(), DEFAULT_HEADER_SIZE as u16);
        assert_eq!(rx.cursor(), DEFAULT_HEADER_SIZE as u16);
        assert_eq!(tx.free_space(), (DEFAULT_CAPACITY - DEFAULT_HEADER_SIZE) as usize - 1);
    }

    #[test]
    fn test_wrap_places_next_byte_at_header() {
        let (mut tx, mut rx) = RingChannel::pair(small()).unwrap();

        // Push exactly capacity - header_size bytes in two rounds.
        tx.push(&[1; 7]).unwrap();
        rx.drain(usize::MAX);
        tx.push(&[2; 6]).unwrap();
        assert_eq!(tx.cursor(), 3, "cursor wraps to header_size on reaching capacity");
        rx.drain(usize::MAX);

        tx.push(&[0xAB]).unwrap();
        assert_eq!(tx.channel().byte_at(3), 0xAB);
        assert_eq!(tx.cursor(), 4);
        assert_eq!(rx.drain(usize::MAX), vec![0xAB]);
    }

    #[test]
    fn test_write_split_across_boundary() {
        let (mut tx, mut rx) = RingChannel::pair(small()).unwrap();

        tx.push(&[0; 10]).unwrap();
        rx.drain(usize::MAX);
        // cursor = 13, three bytes before the end
        tx.push(b"wrapped").unwrap();
        assert_eq!(tx.cursor(), 7);
        assert_eq!(rx.available(), 7);
        assert_eq!(rx.drain(usize::MAX), b"wrapped");
    }

    #[test]
    fn test_peek_after_producer_wrapped_past_reader() {
        let (mut tx, mut rx) = RingChannel::pair(small()).unwrap();

        tx.push(&[0; 12]).unwrap();
        rx.drain(usize::MAX);
        tx.push(&[7; 5]).unwrap();
        // producer cursor (7) is numerically below the reader cursor (15)
        assert!(tx.cursor() < rx.cursor());
        assert_eq!(rx.channel().peek_available(rx.cursor()), 5);
    }

    #[test]
    fn test_overflow_rejected_without_writing() {
        let (mut tx, mut rx) = RingChannel::pair(small()).unwrap();

        tx.push(&[1; 12]).unwrap();
        assert_eq!(tx.free_space(), 0);
        assert_eq!(
            tx.push(&[9]),
            Err(RingError::Overflow {
                requested: 1,
                free: 0
            })
        );
        assert_eq!(rx.drain(usize::MAX), vec![1; 12]);
        assert_eq!(tx.free_space(), 12);
    }

    #[test]
    fn test_full_payload_in_one_push_is_rejected() {
        let (mut tx, _rx) = RingChannel::pair(small()).unwrap();
        assert!(matches!(tx.push(&[0; 13]), Err(RingError::Overflow { requested: 13, free: 12 })));
    }

    #[test]
    fn test_skip_to_producer() {
        let (mut tx, mut rx) = RingChannel::pair(small()).unwrap();

        tx.push(b"stale").unwrap();
        assert_eq!(rx.skip_to_producer(), 5);
        assert_eq!(rx.available(), 0);
        assert_eq!(tx.free_space(), 12);

        tx.push(b"new").unwrap();
        assert_eq!(rx.drain(usize::MAX), b"new");
    }

    #[test]
    fn test_layout_validation() {
        assert!(RingConfig::default().validate().is_ok());
        assert_eq!(
            RingConfig::new(MAX_CAPACITY + 1, 3).validate(),
            Err(LayoutError::CapacityTooLarge {
                capacity: MAX_CAPACITY + 1,
                max: MAX_CAPACITY
            })
        );
        assert_eq!(RingConfig::new(16, 0).validate(), Err(LayoutError::EmptyHeader));
        assert!(matches!(
            RingConfig::new(4, 3).validate(),
            Err(LayoutError::PayloadTooSmall { .. })
        ));
        assert!(RingConfig::new(MAX_CAPACITY, 3).validate().is_ok());
    }

    #[test]
    fn test_max_capacity_cursor_fits() {
        let (mut tx, mut rx) = RingChannel::pair(RingConfig::new(MAX_CAPACITY, 3)).unwrap();
        let chunk = vec![0x5A; 40_000];
        tx.push(&chunk).unwrap();
        rx.drain(usize::MAX);
        tx.push(&chunk).unwrap();
        assert_eq!(rx.drain(usize::MAX), chunk);
        assert!(rx.cursor() as u32 >= 3);
    }

    #[test]
    fn test_threaded_round_trip_across_wrap() {
        let (mut tx, mut rx) = RingChannel::pair(RingConfig::new(64, 3)).unwrap();
        let total: usize = 10_000;

        let producer = std::thread::spawn(move || {
            let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
            let mut rest = &data[..];
            while !rest.is_empty() {
                let n = tx.free_space().min(rest.len()).min(17);
                if n == 0 {
                    std::thread::yield_now();
                    continue;
                }
                tx.push(&rest[..n]).unwrap();
                rest = &rest[n..];
            }
        });

        let mut received = Vec::with_capacity(total);
        while received.len() < total {
            if rx.drain_into(&mut received, 23) == 0 {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();

        let expected: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        assert_eq!(received, expected);
    }
}
