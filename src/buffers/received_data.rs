use std::collections::VecDeque;
use std::sync::Arc;
use bytes::{Bytes, BytesMut};
use crate::buffers::buffer_pool::BufferPool;

/// A byte stream assembled from the buffers of successive reads. Frames can span buffer
///  boundaries, so parsing peeks at the stream without consuming it until a complete frame is
///  available.
///
/// Fully consumed buffers are returned to the pool.
pub struct ReceivedData {
    pool: Arc<BufferPool>,
    buffers: VecDeque<BytesMut>,
    /// read position inside the first buffer
    offset: usize,
    remaining: usize,
}

impl ReceivedData {
    pub fn new(pool: Arc<BufferPool>) -> ReceivedData {
        ReceivedData {
            pool,
            buffers: Default::default(),
            offset: 0,
            remaining: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    pub fn append(&mut self, buf: BytesMut) {
        if buf.is_empty() {
            self.pool.release(buf);
            return;
        }
        self.remaining += buf.len();
        self.buffers.push_back(buf);
    }

    /// Copies the first `dst.len()` bytes into `dst` without consuming them. Returns `false`
    ///  (leaving `dst` in an unspecified state) if fewer bytes are available.
    pub fn peek(&self, dst: &mut [u8]) -> bool {
        if dst.len() > self.remaining {
            return false;
        }

        let mut copied = 0;
        let mut offset = self.offset;
        for buf in &self.buffers {
            if copied == dst.len() {
                break;
            }
            let available = &buf[offset..];
            let n = available.len().min(dst.len() - copied);
            dst[copied..copied+n].copy_from_slice(&available[..n]);
            copied += n;
            offset = 0;
        }
        true
    }

    /// Discards `n` bytes. NB: `n` must not exceed [ReceivedData::remaining]
    pub fn advance(&mut self, mut n: usize) {
        assert!(n <= self.remaining, "advancing {} bytes with only {} remaining", n, self.remaining);

        self.remaining -= n;
        while n > 0 {
            let front_len = self.buffers.front()
                .map(|b| b.len() - self.offset)
                .unwrap_or(0);

            if n < front_len {
                self.offset += n;
                return;
            }

            n -= front_len;
            self.release_front();
        }

        if self.buffers.front().map(|b| b.len() == self.offset).unwrap_or(false) {
            self.release_front();
        }
    }

    /// Consumes `n` bytes, returning them as a single contiguous buffer
    pub fn take(&mut self, n: usize) -> Bytes {
        let mut result = BytesMut::with_capacity(n);
        result.resize(n, 0);
        if !self.peek(&mut result) {
            panic!("taking {} bytes with only {} remaining", n, self.remaining);
        }
        self.advance(n);
        result.freeze()
    }

    /// Discards all data, returning the buffers to the pool
    pub fn clear(&mut self) {
        while !self.buffers.is_empty() {
            self.release_front();
        }
        self.remaining = 0;
    }

    fn release_front(&mut self) {
        if let Some(buf) = self.buffers.pop_front() {
            self.pool.release(buf);
        }
        self.offset = 0;
    }
}

impl Drop for ReceivedData {
    fn drop(&mut self) {
        self.clear();
    }
}
