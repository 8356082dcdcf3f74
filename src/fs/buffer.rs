//! Buffer-cache heads as the block layer sees them.
//!
//! The cache's hashing and reclamation are the filesystem's business; the
//! request queue only needs the head itself: the block's bytes, the
//! dirty/uptodate state bits, and the lock word that pins a buffer for the
//! lifetime of an in-flight request. The lock is not a mutex — it is taken
//! in process context and dropped from the disk interrupt when the request
//! completes, with the wait channel carrying the handoff.

use alloc::sync::Arc;
use spin::Mutex;

use crate::fs::BLOCK_SIZE;
use crate::sched::WaitChannel;

pub struct BufferHead {
    pub dev: usize,
    pub block: u64,
    pub data: [u8; BLOCK_SIZE],
    /// Contents reflect the disk.
    pub uptodate: bool,
    /// Contents are newer than the disk.
    pub dirty: bool,
    /// Pinned by an in-flight (or being-built) request.
    pub locked: bool,
    /// Sleepers waiting for the lock to drop. Shared so a waiter can park
    /// on it after dropping the head's spinlock.
    pub wait: Arc<WaitChannel>,
}

impl BufferHead {
    pub fn new(dev: usize, block: u64) -> BufferRef {
        Arc::new(Mutex::new(BufferHead {
            dev,
            block,
            data: [0u8; BLOCK_SIZE],
            uptodate: false,
            dirty: false,
            locked: false,
            wait: Arc::new(WaitChannel::new()),
        }))
    }
}

pub type BufferRef = Arc<Mutex<BufferHead>>;
