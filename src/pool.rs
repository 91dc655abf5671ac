//! Byte-buffer pool
//!
//! Writer jobs carry quantized bytes in buffers rented from this pool so
//! the audio callbacks do not allocate in steady state: after warm-up,
//! every rent is satisfied from a previously returned buffer. Rent and
//! return are safe from any thread; the lock is held only for the
//! pop/push.

use parking_lot::Mutex;
use std::sync::Arc;

/// Retain at most this many idle buffers; anything beyond is dropped on
/// return so a burst does not pin memory forever.
const MAX_IDLE: usize = 64;

#[derive(Clone)]
pub struct BufferPool {
    idle: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            idle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Rent a buffer with `len == n`. Reuses an idle buffer with enough
    /// capacity when one exists; allocates otherwise.
    pub fn rent(&self, n: usize) -> Vec<u8> {
        let reused = {
            let mut idle = self.idle.lock();
            match idle.iter().position(|b| b.capacity() >= n) {
                Some(i) => Some(idle.swap_remove(i)),
                None => idle.pop(),
            }
        };
        let mut buf = reused.unwrap_or_default();
        buf.clear();
        buf.resize(n, 0);
        buf
    }

    /// Return a buffer to the pool. Never fails.
    pub fn give_back(&self, buf: Vec<u8>) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push(buf);
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
