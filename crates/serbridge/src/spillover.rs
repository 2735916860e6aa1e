//! Bytes received from the inbound channel but not yet handed to the caller.

use std::collections::VecDeque;

/// FIFO of over-read bytes. Owned by the foreground side only.
#[derive(Debug, Default, Clone)]
pub struct SpilloverBuffer {
    bytes: VecDeque<u8>,
}

impl SpilloverBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Append to the back.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.bytes.extend(bytes);
    }

    /// Pop exactly `n` bytes from the front, or nothing if fewer are held.
    pub fn take_exact(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.bytes.len() < n {
            return None;
        }
        Some(self.bytes.drain(..n).collect())
    }

    /// Pop everything.
    pub fn take_all(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes.len());
        let (front, back) = self.bytes.as_slices();
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        self.bytes.clear();
        out
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_exact_needs_enough_bytes() {
        let mut buf = SpilloverBuffer::new();
        buf.extend(b"abc");

        assert_eq!(buf.take_exact(4), None);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.take_exact(2).as_deref(), Some(&b"ab"[..]));
        assert_eq!(buf.take_exact(1).as_deref(), Some(&b"c"[..]));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_order_preserved_across_appends() {
        let mut buf = SpilloverBuffer::new();
        buf.extend(b"12");
        buf.extend(b"345");
        assert_eq!(buf.take_exact(3).unwrap(), b"123");
        buf.extend(b"6");
        assert_eq!(buf.take_all(), b"456");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_take_all_after_wrapped_deque() {
        let mut buf = SpilloverBuffer::new();
        // Force the deque's storage to wrap internally.
        buf.extend(&[0; 6]);
        buf.take_exact(5);
        buf.extend(b"xyz0123456789");
        assert_eq!(buf.take_all(), b"\0xyz0123456789");
    }

    #[test]
    fn test_take_exact_zero() {
        let mut buf = SpilloverBuffer::new();
        assert_eq!(buf.take_exact(0), Some(Vec::new()));
    }

    #[test]
    fn test_clear() {
        let mut buf = SpilloverBuffer::new();
        buf.extend(b"stale");
        buf.clear();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.take_all(), Vec::<u8>::new());
    }
}
