//! Packet-sized buffers. Every buffer of the shared arena is one of these, allocated when the
//!  endpoint starts and reused for its whole lifetime; the receive loop has one more for
//!  reading datagrams off the socket.
//!
//! A buffer never grows: writing beyond its capacity is a bug and panics. `as_ref()` and
//!  `as_mut()` cover the filled part (`..len`) only.

use std::fmt::{Debug, Formatter};
use bytes::buf::UninitSlice;

/// A fixed-capacity buffer holding at most one datagram
#[derive(Eq)]
pub struct FixedBuf {
    buf: Vec<u8>,
    len: usize,
}
impl FixedBuf {
    /// create a new FixedBuf instance with the given buffer capacity
    pub fn new(capacity: usize) -> FixedBuf {
        FixedBuf {
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// make the entire underlying buffer available through as_ref() etc.
    pub fn maximize_len(&mut self) {
        self.len = self.capacity();
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }

    /// Replace the buffer's content with `data`. Returns `false` and leaves the buffer empty if
    ///  `data` does not fit.
    pub fn fill_from(&mut self, data: &[u8]) -> bool {
        self.len = 0;
        if data.len() > self.capacity() {
            return false;
        }
        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
        true
    }

    /// This is a convenience function for test code. It derives the buffer's capacity from the
    ///  slice used for initialization, which is a shortcut not intended for production usage.
    #[cfg(test)]
    pub fn from_slice(capacity: usize, data: &[u8]) -> FixedBuf {
        let mut result = FixedBuf::new(capacity);
        bytes::BufMut::put_slice(&mut result, data);
        result
    }
}

impl PartialEq for FixedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for FixedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl AsRef<[u8]> for FixedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
impl AsMut<[u8]> for FixedBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for FixedBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}
