//! Output history for replay and incremental delivery.
//!
//! Every byte ever appended has an absolute offset. The end offset only grows;
//! once the retained history exceeds the capacity the oldest bytes are
//! dropped and the start offset moves forward with them.

use std::collections::VecDeque;

/// Capacity-bounded byte history addressed by absolute offsets.
#[derive(Debug)]
pub struct OutputBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
    /// Absolute offset of `buf[0]`.
    start: u64,
}

impl OutputBuffer {
    /// Create a buffer retaining at most `capacity` bytes (0 = unbounded).
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            capacity,
            start: 0,
        }
    }

    /// Append data, evicting the oldest bytes if over capacity.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend(data);
        if self.capacity > 0 && self.buf.len() > self.capacity {
            let excess = self.buf.len() - self.capacity;
            self.buf.drain(..excess);
            self.start += excess as u64;
        }
    }

    /// Offset of the oldest retained byte.
    pub fn start_offset(&self) -> u64 {
        self.start
    }

    /// Total bytes ever appended; the offset the next byte will get.
    pub fn end_offset(&self) -> u64 {
        self.start + self.buf.len() as u64
    }

    /// Everything retained from `offset` onward.
    ///
    /// Returns the bytes and the absolute offset of the first returned byte,
    /// which is later than `offset` when that part was already evicted.
    pub fn read_from(&self, offset: u64) -> (Vec<u8>, u64) {
        let from = offset.clamp(self.start, self.end_offset());
        let skip = (from - self.start) as usize;
        (self.buf.range(skip..).copied().collect(), from)
    }

    /// Number of bytes currently retained.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
