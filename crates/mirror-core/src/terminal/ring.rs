//! Bounded replay buffer for late-joining clients.

use std::sync::Mutex;

/// Keeps the last `max` bytes of PTY output. New clients receive a
/// snapshot of this buffer before any live frames.
pub struct RingBuffer {
    inner: Mutex<Vec<u8>>,
    max: usize,
}

impl RingBuffer {
    pub fn new(max: usize) -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            max,
        }
    }

    /// Append a chunk, discarding the oldest bytes once capacity is
    /// exceeded. A chunk at least as large as the buffer replaces the
    /// contents with its tail.
    pub fn append(&self, data: &[u8]) {
        let mut buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if data.len() >= self.max {
            buf.clear();
            buf.extend_from_slice(&data[data.len() - self.max..]);
            return;
        }

        let overflow = (buf.len() + data.len()).saturating_sub(self.max);
        if overflow > 0 {
            buf.drain(..overflow);
        }
        buf.extend_from_slice(data);
    }

    /// Independent copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        let buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        buf.clone()
    }

    pub fn len(&self) -> usize {
        let buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_snapshot() {
        let ring = RingBuffer::new(64);
        ring.append(b"hello world");
        assert_eq!(ring.snapshot(), b"hello world");
        assert_eq!(ring.len(), 11);
    }

    #[test]
    fn evicts_oldest_on_overflow() {
        let ring = RingBuffer::new(8);
        ring.append(b"abcd");
        ring.append(b"efgh");
        ring.append(b"ij");
        assert_eq!(ring.snapshot(), b"cdefghij");
    }

    #[test]
    fn oversized_chunk_keeps_tail() {
        let ring = RingBuffer::new(4);
        ring.append(b"0123456789");
        assert_eq!(ring.snapshot(), b"6789");
    }

    #[test]
    fn chunk_exactly_capacity() {
        let ring = RingBuffer::new(6);
        ring.append(b"xx");
        ring.append(b"abcdef");
        assert_eq!(ring.snapshot(), b"abcdef");
    }

    #[test]
    fn empty_snapshot() {
        let ring = RingBuffer::new(16);
        assert!(ring.snapshot().is_empty());
        assert!(ring.is_empty());
    }

    #[test]
    fn contents_equal_tail_of_concatenation() {
        let ring = RingBuffer::new(10);
        let chunks: &[&[u8]] = &[b"one", b"two", b"three", b"four", b"fifteen!!", b"x"];
        let mut all = Vec::new();
        for chunk in chunks {
            ring.append(chunk);
            all.extend_from_slice(chunk);
        }
        let tail = &all[all.len().saturating_sub(10)..];
        assert_eq!(ring.snapshot(), tail);
    }

    #[test]
    fn snapshot_is_independent() {
        let ring = RingBuffer::new(16);
        ring.append(b"data");
        let snap = ring.snapshot();
        ring.append(b"more");
        assert_eq!(snap, b"data");
        assert_eq!(ring.snapshot(), b"datamore");
    }
}
