//! Shared buffer pool with a two-class recycling discipline.
//!
//! Connections lease buffers in two standard sizes: *header* buffers for
//! request/response heads and *body* buffers for content. Every lease must
//! be returned exactly once; the outstanding count exposes the invariant to
//! tests and to the low-resource policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::BytesMut;

use crate::metrics;

/// Maximum recycled buffers retained per size class.
const MAX_RETAINED: usize = 1024;

/// A pool of reusable byte buffers shared across connections.
pub struct BufferPool {
    header_size: usize,
    buffer_size: usize,
    headers: Mutex<Vec<BytesMut>>,
    buffers: Mutex<Vec<BytesMut>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Create a pool handing out `header_size` header buffers and
    /// `buffer_size` body buffers.
    pub fn new(header_size: usize, buffer_size: usize) -> Self {
        BufferPool {
            header_size,
            buffer_size,
            headers: Mutex::new(Vec::new()),
            buffers: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Lease a header-sized buffer.
    pub fn get_header(&self) -> BytesMut {
        self.lease(&self.headers, self.header_size)
    }

    /// Lease a body-sized buffer.
    pub fn get_buffer(&self) -> BytesMut {
        self.lease(&self.buffers, self.buffer_size)
    }

    /// Lease a buffer of at least `size` bytes. Non-standard sizes are
    /// allocated fresh and dropped on return.
    pub fn get_sized(&self, size: usize) -> BytesMut {
        if size <= self.header_size {
            return self.get_header();
        }
        if size <= self.buffer_size {
            return self.get_buffer();
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        metrics::POOL_ACQUIRED.increment();
        metrics::POOL_MISSES.increment();
        BytesMut::with_capacity(size)
    }

    /// Return a leased buffer. The caller must not touch it afterwards.
    pub fn return_buffer(&self, mut buffer: BytesMut) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        metrics::POOL_RETURNED.increment();

        // Reclaim capacity consumed by `advance` before classifying.
        buffer.clear();
        buffer.reserve(self.header_size);

        let cap = buffer.capacity();
        if cap >= self.buffer_size {
            let mut buffers = self.buffers.lock().unwrap();
            if buffers.len() < MAX_RETAINED {
                buffers.push(buffer);
            }
        } else if cap >= self.header_size {
            let mut headers = self.headers.lock().unwrap();
            if headers.len() < MAX_RETAINED {
                headers.push(buffer);
            }
        }
        // Odd-sized buffers are dropped.
    }

    /// Buffers currently leased and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn lease(&self, stack: &Mutex<Vec<BytesMut>>, size: usize) -> BytesMut {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        metrics::POOL_ACQUIRED.increment();
        match stack.lock().unwrap().pop() {
            Some(mut buffer) => {
                buffer.clear();
                buffer.reserve(size);
                buffer
            }
            None => {
                metrics::POOL_MISSES.increment();
                BytesMut::with_capacity(size)
            }
        }
    }
}
