//! # Buffer Pool
//!
//! Fixed-size byte buffers shared by the whole engine: receive, decrypt and decompress
//! buffers of every connection, packet group serialization buffers and send buffers.
//!
//! ## Performance
//! - No allocation on the steady-state path: buffers are recycled, not zeroed
//! - Never blocks: an empty pool allocates a new buffer
//! - One size class only; payloads that must outlive the pool are detached or copied
//!   into ordinary heap values
//! - Idle buffers are capped by [`BufferPool::with_max_idle`]; extra returns are freed
//!
//! ## Usage
//! ```rust
//! use packet_engine::utils::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(1024, 4);
//! let mut buffer = pool.acquire();
//! buffer[0] = 0x1a;
//! assert_eq!(buffer.len(), 1024);
//! drop(buffer); // returned to the pool
//! assert_eq!(pool.available(), 4);
//! ```

use crate::config::DEFAULT_BUFFER_SIZE;
use crate::utils::pool::{ObjectPool, Pooled};

/// A pooled buffer that returns itself to the pool when dropped
pub type PooledBuffer = Pooled<Box<[u8]>>;

/// Thread-safe pool of fixed-size buffers
#[derive(Clone, Debug)]
pub struct BufferPool {
    pool: ObjectPool<Box<[u8]>>,
    buffer_size: usize,
}

impl BufferPool {
    /// Create a pool of `buffer_size` byte buffers, allocating `preallocate` of them now
    pub fn new(buffer_size: usize, preallocate: usize) -> Self {
        Self::with_max_idle(buffer_size, preallocate, usize::MAX)
    }

    /// Like [`BufferPool::new`], but keeps at most `max_idle` buffers between uses
    pub fn with_max_idle(buffer_size: usize, preallocate: usize, max_idle: usize) -> Self {
        let pool = ObjectPool::with_max_idle(
            move || vec![0u8; buffer_size].into_boxed_slice(),
            |_| {},
            max_idle,
        );
        pool.prefill(preallocate);
        Self { pool, buffer_size }
    }

    /// Acquire a buffer from the pool (or allocate a new one if the pool is empty)
    pub fn acquire(&self) -> PooledBuffer {
        self.pool.acquire()
    }

    /// Size of every buffer handed out by this pool
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get the current number of available buffers in the pool
    pub fn available(&self) -> usize {
        self.pool.available()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, 0)
    }
}
