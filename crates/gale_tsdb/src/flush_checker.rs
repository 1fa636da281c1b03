//! Background flush scheduling over the family manager.
//!
//! One process-wide thread sweeps the registry on a fixed interval and
//! flushes every family whose memory database is over its TTL or size
//! budget. A flush failure is logged and the sweep keeps going; the
//! family retains its immutable buffer and is retried by its own close
//! path or a direct flush.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use gale_common::cancel::CancelToken;
use gale_common::error::GaleError;

use crate::family_manager::FamilyManager;

/// Sweep counters, shared with the handle for observability.
#[derive(Debug, Default)]
pub struct FlushCheckerStats {
    pub sweeps: AtomicU64,
    pub flushes_triggered: AtomicU64,
    pub flush_failures: AtomicU64,
}

/// Handle for the checker thread. Dropping it stops the loop.
pub struct FlushCheckerHandle {
    cancel: CancelToken,
    join_handle: Option<JoinHandle<()>>,
    pub stats: Arc<FlushCheckerStats>,
}

impl FlushCheckerHandle {
    /// Signal the checker to stop without waiting.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait for the thread to finish.
    pub fn stop_and_join(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FlushCheckerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Periodic flush checker.
pub struct FlushChecker;

impl FlushChecker {
    /// Start the checker over `manager`, sweeping every `interval`.
    pub fn start(
        manager: Arc<FamilyManager>,
        interval: Duration,
    ) -> Result<FlushCheckerHandle, GaleError> {
        let cancel = CancelToken::new();
        let loop_cancel = cancel.clone();
        let stats = Arc::new(FlushCheckerStats::default());
        let loop_stats = stats.clone();

        let join_handle = std::thread::Builder::new()
            .name("gale-flush-checker".to_string())
            .spawn(move || {
                tracing::info!(interval_ms = interval.as_millis() as u64, "flush checker started");
                while !loop_cancel.wait_for(interval) {
                    loop_stats.sweeps.fetch_add(1, Ordering::Relaxed);
                    manager.walk(|family| {
                        if !family.need_flush() {
                            return;
                        }
                        loop_stats.flushes_triggered.fetch_add(1, Ordering::Relaxed);
                        if let Err(err) = family.flush() {
                            loop_stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                            tracing::error!(
                                family = %family.indicator(),
                                error = %err,
                                "flush checker failed to flush family"
                            );
                        }
                    });
                }
                tracing::info!("flush checker stopped");
            })
            .map_err(|err| {
                GaleError::Internal(format!("failed to spawn flush checker thread: {err}"))
            })?;

        Ok(FlushCheckerHandle {
            cancel,
            join_handle: Some(join_handle),
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use gale_common::config::TsdbConfig;
    use gale_common::timeutil::{Interval, TimeRange};
    use gale_common::types::ShardId;
    use gale_kv::mem::MemoryFamily;

    use crate::buffer::BufferManager;
    use crate::family::DataFamily;
    use crate::row::{FieldValue, StorageRow};
    use crate::shard::Shard;

    struct TestShard {
        buffer: Arc<BufferManager>,
    }

    impl Shard for TestShard {
        fn database_name(&self) -> &str {
            "metrics"
        }

        fn shard_id(&self) -> ShardId {
            7
        }

        fn buffer_manager(&self) -> Arc<BufferManager> {
            self.buffer.clone()
        }
    }

    #[test]
    fn test_checker_flushes_expired_family() {
        let manager = Arc::new(FamilyManager::new());
        let kv = Arc::new(MemoryFamily::new("kv"));
        let shard: Arc<dyn Shard> = Arc::new(TestShard {
            buffer: Arc::new(BufferManager::new()),
        });
        let family = DataFamily::new(
            shard,
            Interval::from_secs(10),
            TimeRange::new(0, 36_000_000),
            0,
            kv.clone() as Arc<dyn gale_kv::Family>,
            TsdbConfig {
                mutable_memdb_ttl_ms: 1,
                ..TsdbConfig::default()
            },
            manager.clone(),
        );

        let mut batch = vec![StorageRow::new(
            1,
            10,
            1_000,
            vec![FieldValue {
                field_id: 1,
                value: 4.2,
            }],
        )];
        family.write_rows(&mut batch).unwrap();
        family.commit_sequence(1, 3);

        let handle = FlushChecker::start(manager, Duration::from_millis(5)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while kv.file_count() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.stop_and_join();

        assert_eq!(kv.file_count(), 1);
        assert_eq!(family.persisted_sequence(1), Some(3));
    }

    #[test]
    fn test_checker_stops_cleanly() {
        let manager = Arc::new(FamilyManager::new());
        let handle = FlushChecker::start(manager, Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let sweeps = handle.stats.sweeps.load(Ordering::Relaxed);
        assert!(sweeps >= 1);
        handle.stop_and_join();
    }
}
