//! Per-family write/flush counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters maintained by one data family. All fields are monotonic except
/// `active_memdbs`, which tracks live memory databases.
#[derive(Debug, Default)]
pub struct FamilyStatistics {
    pub write_batches: AtomicU64,
    pub write_metrics: AtomicU64,
    pub write_fields: AtomicU64,
    pub write_failures: AtomicU64,
    pub active_memdbs: AtomicI64,
    pub memdb_flushes: AtomicU64,
    pub memdb_flush_failures: AtomicU64,
    pub memdb_flush_total_ms: AtomicU64,
}

/// Point-in-time copy for observability surfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyStatisticsSnapshot {
    pub write_batches: u64,
    pub write_metrics: u64,
    pub write_fields: u64,
    pub write_failures: u64,
    pub active_memdbs: i64,
    pub memdb_flushes: u64,
    pub memdb_flush_failures: u64,
    pub memdb_flush_total_ms: u64,
}

impl FamilyStatistics {
    pub fn snapshot(&self) -> FamilyStatisticsSnapshot {
        FamilyStatisticsSnapshot {
            write_batches: self.write_batches.load(Ordering::Relaxed),
            write_metrics: self.write_metrics.load(Ordering::Relaxed),
            write_fields: self.write_fields.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            active_memdbs: self.active_memdbs.load(Ordering::Relaxed),
            memdb_flushes: self.memdb_flushes.load(Ordering::Relaxed),
            memdb_flush_failures: self.memdb_flush_failures.load(Ordering::Relaxed),
            memdb_flush_total_ms: self.memdb_flush_total_ms.load(Ordering::Relaxed),
        }
    }
}
