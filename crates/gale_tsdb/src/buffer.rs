//! Per-shard memory accounting for memory databases.
//!
//! Every memory database charges its heap estimate here and releases it on
//! close, so the shard has one number to report and to throttle on.

use std::sync::atomic::{AtomicU64, Ordering};

/// Allocated-bytes ledger shared by all memory databases of one shard.
#[derive(Debug, Default)]
pub struct BufferManager {
    allocated: AtomicU64,
    high_water: AtomicU64,
}

impl BufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn charge(&self, bytes: u64) {
        let now = self.allocated.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.high_water.fetch_max(now, Ordering::Relaxed);
    }

    pub fn release(&self, bytes: u64) {
        // saturate rather than wrap if accounting ever drifts
        let mut current = self.allocated.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.allocated.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn high_water_bytes(&self) -> u64 {
        self.high_water.load(Ordering::Relaxed)
    }
}
