use bytes::BytesMut;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, trace};

/// Pool of equally sized byte buffers, shared by all pumps.
///
/// NB: This is the only resource shared across pump threads apart from the event queues, so it
///      is internally synchronized
pub struct BufferPool {
    buf_size: usize,
    max_pool_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            buf_size,
            max_pool_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// number of buffers currently held by the pool
    pub fn pooled(&self) -> usize {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn acquire_default(&self) -> BytesMut {
        self.acquire(self.buf_size)
    }

    /// Returns an empty buffer with a capacity of at least `min_capacity`. Requests exceeding the
    ///  pool's buffer size are served by a dedicated allocation.
    pub fn acquire(&self, min_capacity: usize) -> BytesMut {
        if min_capacity > self.buf_size {
            debug!("requested capacity {} exceeds pooled buffer size {}: allocating dedicated buffer", min_capacity, self.buf_size);
            return BytesMut::with_capacity(min_capacity);
        }

        {
            let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    /// Clears the buffer's length (not its contents) and keeps it for reuse. Buffers that do
    ///  not have the pool's regular capacity (dedicated allocations, or buffers that grew while
    ///  in use) are dropped.
    pub fn release(&self, mut buffer: BytesMut) {
        if buffer.capacity() < self.buf_size || buffer.capacity() > 2*self.buf_size {
            trace!("released buffer with capacity {} does not fit the pool - discarding", buffer.capacity());
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if buffers.len() < self.max_pool_size {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}
