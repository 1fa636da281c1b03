//! Data family: one per-shard, per-window storage unit.
//!
//! The family buffers pre-routed rows in a double-buffered memory
//! database, tracks per-leader replication sequences for idempotent
//! replay, flushes the buffered window into a KV family, and merges the
//! in-memory and on-disk views for queries.
//!
//! Flush is single-flight: a CAS on `is_flushing` admits exactly one
//! flush at a time, a second caller returns immediately with success.
//! The promoted (immutable) memory database stays queryable for the
//! whole disk write; on failure it is retained so the next flush or
//! `close` retries it, and sequences are not advanced. Ack callbacks
//! fire exactly once per successful flush, in the commit phase under the
//! family mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use gale_common::cancel::CancelToken;
use gale_common::config::TsdbConfig;
use gale_common::error::StorageError;
use gale_common::timeutil::{Interval, IntervalCalculator, TimeRange};
use gale_common::types::{LeaderId, SeqNo};
use gale_kv::{Family as _, Flusher as _, Reader as _, Snapshot as _};

use crate::family_manager::FamilyManager;
use crate::filter::{FileFilterResultSet, FilterResultSet, QueryContext};
use crate::memdb::{default_memdb_factory, MemDbFactory, MemoryDatabase, MemoryDatabaseCfg};
use crate::row::StorageRow;
use crate::sequence::SequenceTable;
use crate::table::MetricDataFlusher as _;
use crate::shard::Shard;
use crate::stats::FamilyStatistics;
use crate::table::{KvDataFlusher, MetricBlock};

/// Ack hook registered by a replica consumer. Registrations are durable
/// subscriptions: a hook fires on every successful flush that covers its
/// leader, and once at registration when a sequence is already present.
pub type AckFn = Box<dyn Fn(SeqNo) + Send + Sync>;

/// Mutable family state guarded by the family mutex.
struct FamilyState {
    mutable: Option<Arc<dyn MemoryDatabase>>,
    immutable: Option<Arc<dyn MemoryDatabase>>,
    /// Sequence snapshot captured when `immutable` was promoted.
    immutable_seq: Option<HashMap<LeaderId, SeqNo>>,
    callbacks: HashMap<LeaderId, Vec<AckFn>>,
    closed: bool,
}

/// Counted barrier so `close` can drain an in-flight flush.
#[derive(Default)]
struct FlushBarrier {
    count: Mutex<u32>,
    cond: Condvar,
}

impl FlushBarrier {
    fn enter(&self) {
        *self.count.lock() += 1;
    }

    fn exit(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }
}

/// Storage unit for one `(database, shard, family window)`.
pub struct DataFamily {
    indicator: String,
    shard: Arc<dyn Shard>,
    interval: Interval,
    interval_calc: IntervalCalculator,
    family_time: i64,
    time_range: TimeRange,
    family: Arc<dyn gale_kv::Family>,
    config: TsdbConfig,
    manager: Arc<FamilyManager>,
    memdb_factory: MemDbFactory,

    state: Mutex<FamilyState>,
    /// Highest committed sequence per leader.
    seq: SequenceTable,
    /// Sequence last persisted to disk; never ahead of `seq`.
    persist_seq: SequenceTable,

    is_flushing: AtomicBool,
    flush_barrier: FlushBarrier,
    cancel: CancelToken,
    stats: FamilyStatistics,
}

impl DataFamily {
    /// Open a family over `family`, seeding sequences from the persisted
    /// footer, and register it with `manager`.
    pub fn new(
        shard: Arc<dyn Shard>,
        interval: Interval,
        time_range: TimeRange,
        family_time: i64,
        family: Arc<dyn gale_kv::Family>,
        config: TsdbConfig,
        manager: Arc<FamilyManager>,
    ) -> Arc<Self> {
        Self::with_memdb_factory(
            shard,
            interval,
            time_range,
            family_time,
            family,
            config,
            manager,
            default_memdb_factory(),
        )
    }

    /// Like [`DataFamily::new`], with an injected memory database factory.
    #[allow(clippy::too_many_arguments)]
    pub fn with_memdb_factory(
        shard: Arc<dyn Shard>,
        interval: Interval,
        time_range: TimeRange,
        family_time: i64,
        family: Arc<dyn gale_kv::Family>,
        config: TsdbConfig,
        manager: Arc<FamilyManager>,
        memdb_factory: MemDbFactory,
    ) -> Arc<Self> {
        let indicator = format!(
            "{}/{}/{}",
            shard.database_name(),
            shard.shard_id(),
            family_time
        );

        // recover the persisted watermarks before accepting writes
        let persisted = family.get_snapshot().sequences();
        let seq = SequenceTable::new();
        seq.restore(persisted.clone());
        let persist_seq = SequenceTable::new();
        persist_seq.restore(persisted);

        let data_family = Arc::new(Self {
            indicator,
            shard,
            interval,
            interval_calc: interval.calculator(),
            family_time,
            time_range,
            family,
            config,
            manager: manager.clone(),
            memdb_factory,
            state: Mutex::new(FamilyState {
                mutable: None,
                immutable: None,
                immutable_seq: None,
                callbacks: HashMap::new(),
                closed: false,
            }),
            seq,
            persist_seq,
            is_flushing: AtomicBool::new(false),
            flush_barrier: FlushBarrier::default(),
            cancel: CancelToken::new(),
            stats: FamilyStatistics::default(),
        });
        manager.add_family(data_family.clone());
        data_family
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn indicator(&self) -> &str {
        &self.indicator
    }

    pub fn shard(&self) -> &Arc<dyn Shard> {
        &self.shard
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn family_time(&self) -> i64 {
        self.family_time
    }

    pub fn time_range(&self) -> TimeRange {
        self.time_range
    }

    pub fn family(&self) -> &Arc<dyn gale_kv::Family> {
        &self.family
    }

    pub fn statistics(&self) -> &FamilyStatistics {
        &self.stats
    }

    /// Highest committed sequence for `leader`.
    pub fn leader_sequence(&self, leader: LeaderId) -> Option<SeqNo> {
        self.seq.get(leader)
    }

    /// Sequence last persisted to disk for `leader`.
    pub fn persisted_sequence(&self, leader: LeaderId) -> Option<SeqNo> {
        self.persist_seq.get(leader)
    }

    /// Heap estimate of the writable memory database. The immutable one
    /// is in flight and intentionally not reported.
    pub fn memdb_size(&self) -> u64 {
        let state = self.state.lock();
        state.mutable.as_ref().map_or(0, |memdb| memdb.mem_size())
    }

    // ── Write path ──────────────────────────────────────────────────────

    /// Buffer a batch of rows already routed to this family window.
    /// Per-row failures are counted and skipped; only a memory database
    /// creation failure drops the batch. Sequences are not advanced here:
    /// the caller commits once the batch is durable upstream.
    pub fn write_rows(&self, rows: &mut [StorageRow]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }

        loop {
            let memdb = match self.get_or_create_memdb() {
                Ok(memdb) => memdb,
                Err(err) => {
                    self.stats
                        .write_failures
                        .fetch_add(rows.len() as u64, Ordering::Relaxed);
                    return Err(err);
                }
            };
            let guard = memdb.acquire_write();
            if memdb.is_read_only() {
                // lost the race against a promotion; a fresh mutable
                // memory database exists now
                drop(guard);
                continue;
            }

            for row in rows.iter_mut() {
                if !row.writable {
                    self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                row.slot_index = self
                    .interval_calc
                    .calc_slot(row.timestamp, self.family_time);
                match memdb.write_row(row) {
                    Ok(_) => {
                        self.stats.write_metrics.fetch_add(1, Ordering::Relaxed);
                        self.stats
                            .write_fields
                            .fetch_add(row.fields.len() as u64, Ordering::Relaxed);
                    }
                    Err(err) => {
                        self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            family = %self.indicator,
                            error = %err,
                            "failed writing row"
                        );
                    }
                }
            }
            self.stats.write_batches.fetch_add(1, Ordering::Relaxed);
            drop(guard);
            return Ok(());
        }
    }

    fn get_or_create_memdb(&self) -> Result<Arc<dyn MemoryDatabase>, StorageError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::FamilyClosed);
        }
        if let Some(memdb) = &state.mutable {
            return Ok(memdb.clone());
        }
        let memdb = (self.memdb_factory)(MemoryDatabaseCfg {
            family_time: self.family_time,
            name: self.shard.database_name().to_string(),
            buffer: self.shard.buffer_manager(),
        })?;
        self.stats.active_memdbs.fetch_add(1, Ordering::Relaxed);
        state.mutable = Some(memdb.clone());
        Ok(memdb)
    }

    // ── Replica sequences ───────────────────────────────────────────────

    /// True when `seq` is newer than everything committed for `leader`.
    pub fn validate_sequence(&self, leader: LeaderId, seq: SeqNo) -> bool {
        let _state = self.state.lock();
        self.seq.validate(leader, seq)
    }

    /// Record `seq` for `leader` after the tagged batch was written.
    pub fn commit_sequence(&self, leader: LeaderId, seq: SeqNo) {
        let _state = self.state.lock();
        self.seq.commit(leader, seq);
    }

    /// Register a durable ack subscription for `leader`. When a sequence
    /// is already present the hook fires once synchronously, so consumers
    /// that register late are not stuck waiting for the next flush.
    ///
    /// Hooks run under the family mutex and must not call back into the
    /// family.
    pub fn ack_sequence(&self, leader: LeaderId, ack: AckFn) {
        let mut state = self.state.lock();
        if let Some(seq) = self.seq.get(leader) {
            ack(seq);
        }
        state.callbacks.entry(leader).or_default().push(ack);
    }

    // ── Flush ───────────────────────────────────────────────────────────

    pub fn is_flushing(&self) -> bool {
        self.is_flushing.load(Ordering::Acquire)
    }

    /// True when the writable memory database should be flushed: nothing
    /// is flushing or pending, there is data, and the TTL or the size
    /// budget is exceeded.
    pub fn need_flush(&self) -> bool {
        if self.is_flushing() || self.cancel.is_cancelled() {
            return false;
        }
        let state = self.state.lock();
        if state.closed || state.immutable.is_some() {
            return false;
        }
        let Some(mutable) = &state.mutable else {
            return false;
        };
        if mutable.size() == 0 {
            return false;
        }

        let uptime = mutable.uptime();
        if uptime >= self.config.mutable_memdb_ttl() {
            tracing::info!(
                family = %self.indicator,
                uptime_ms = uptime.as_millis() as u64,
                ttl_ms = self.config.mutable_memdb_ttl_ms,
                "memory database expired, need flush"
            );
            return true;
        }
        let mem_size = mutable.mem_size();
        if mem_size >= self.config.max_memdb_size_bytes {
            tracing::info!(
                family = %self.indicator,
                mem_size,
                max_memdb_size = self.config.max_memdb_size_bytes,
                "memory database above size threshold, need flush"
            );
            return true;
        }
        false
    }

    /// Flush the buffered window to the KV family. Single-flight: when a
    /// flush is already running this returns immediately with success.
    pub fn flush(&self) -> Result<(), StorageError> {
        if self.cancel.is_cancelled() {
            // shutting down; close performs the final synchronous flushes
            return Ok(());
        }
        if self
            .is_flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        self.flush_barrier.enter();
        let result = self.do_flush();
        self.flush_barrier.exit();
        self.is_flushing.store(false, Ordering::Release);
        result
    }

    fn do_flush(&self) -> Result<(), StorageError> {
        let start = Instant::now();

        let (memdb, sequences) = {
            let mut state = self.state.lock();
            if state.closed || self.cancel.is_cancelled() {
                return Ok(());
            }
            if let Some(immutable) = state.immutable.clone() {
                // a previous flush failed mid-write; retry it with the
                // sequence snapshot captured at its promotion
                let sequences = state.immutable_seq.clone().unwrap_or_default();
                (immutable, sequences)
            } else {
                let Some(mutable) = state.mutable.clone() else {
                    return Ok(());
                };
                if mutable.size() == 0 {
                    return Ok(());
                }
                state.mutable = None;
                mutable.mark_read_only();
                let sequences = self.seq.snapshot();
                state.immutable = Some(mutable.clone());
                state.immutable_seq = Some(sequences.clone());
                (mutable, sequences)
            }
        };

        let mem_size = memdb.mem_size();
        self.flush_memdb(&sequences, memdb.as_ref())?;

        {
            let mut state = self.state.lock();
            state.immutable = None;
            state.immutable_seq = None;
            self.commit_flushed(&mut state, &sequences);
        }

        tracing::info!(
            family = %self.indicator,
            family_time = self.family_time,
            mem_size,
            duration_ms = start.elapsed().as_millis() as u64,
            "flushed memory database"
        );
        Ok(())
    }

    /// Disk write for one memory database: stage the sequence footer and
    /// every metric block on a fresh KV flusher, then commit. The flusher
    /// is released on every exit path; an error publishes nothing.
    fn flush_memdb(
        &self,
        sequences: &HashMap<LeaderId, SeqNo>,
        memdb: &dyn MemoryDatabase,
    ) -> Result<(), StorageError> {
        let start = Instant::now();
        let mut kv_flusher = self.family.new_flusher();
        for (leader, seq) in sequences {
            kv_flusher.sequence(*leader, *seq);
        }
        let mut data_flusher = KvDataFlusher::new(kv_flusher);

        let written = memdb
            .flush_to(&mut data_flusher)
            .and_then(|_| data_flusher.close());
        if let Err(err) = written {
            self.stats
                .memdb_flush_failures
                .fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                family = %self.indicator,
                error = %err,
                mem_size = memdb.mem_size(),
                "failed to flush memory database"
            );
            return Err(StorageError::FlushWrite(err));
        }

        self.stats.memdb_flushes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .memdb_flush_total_ms
            .fetch_add(start.elapsed().as_millis() as u64, Ordering::Relaxed);
        self.stats.active_memdbs.fetch_sub(1, Ordering::Relaxed);

        if let Err(err) = memdb.close() {
            // the blocks are on disk; retrying this flush would write
            // duplicates, so a close failure is only a warning
            tracing::warn!(
                family = %self.indicator,
                error = %err,
                "failed to close memory database"
            );
        }
        Ok(())
    }

    /// Post-flush commit under the family mutex: refresh the persisted
    /// watermarks and fire ack subscriptions once with the current
    /// sequence. Concurrent committers may have advanced past the
    /// promoted snapshot, so both tables merge with max().
    fn commit_flushed(&self, state: &mut FamilyState, sequences: &HashMap<LeaderId, SeqNo>) {
        for (leader, seq) in sequences {
            self.persist_seq.confirm(*leader, *seq);
            self.seq.confirm(*leader, *seq);
        }
        for leader in sequences.keys() {
            let Some(current) = self.seq.get(*leader) else {
                continue;
            };
            if let Some(acks) = state.callbacks.get(leader) {
                for ack in acks {
                    ack(current);
                }
            }
        }
    }

    // ── Query path ──────────────────────────────────────────────────────

    /// Matching result sets from both memory databases and the on-disk
    /// view. The file set owns its KV snapshot; drop the sets to release
    /// it.
    pub fn filter(
        &self,
        ctx: &QueryContext,
    ) -> Result<Vec<Box<dyn FilterResultSet>>, StorageError> {
        let mut result = self.memory_filter(ctx)?;
        result.extend(self.file_filter(ctx)?);
        Ok(result)
    }

    fn memory_filter(
        &self,
        ctx: &QueryContext,
    ) -> Result<Vec<Box<dyn FilterResultSet>>, StorageError> {
        let state = self.state.lock();
        let mut result = Vec::new();
        if let Some(mutable) = &state.mutable {
            result.extend(mutable.filter(ctx)?);
        }
        if let Some(immutable) = &state.immutable {
            result.extend(immutable.filter(ctx)?);
        }
        Ok(result)
    }

    fn file_filter(
        &self,
        ctx: &QueryContext,
    ) -> Result<Vec<Box<dyn FilterResultSet>>, StorageError> {
        let snapshot = self.family.get_snapshot();
        let readers = match snapshot.find_readers(ctx.metric_id) {
            Ok(readers) => readers,
            Err(err) => {
                tracing::error!(
                    family = %self.indicator,
                    error = %err,
                    "failed to find readers for filter"
                );
                return Err(err.into());
            }
        };
        let Some(query_slots) =
            self.interval_calc
                .slot_range(self.family_time, &self.time_range, &ctx.time_range)
        else {
            return Ok(Vec::new());
        };

        let mut blocks = Vec::new();
        for reader in readers {
            let Some(raw) = reader.get(ctx.metric_id) else {
                continue;
            };
            let block = MetricBlock::decode(&raw)?;
            if block.slot_range().overlaps(&query_slots) {
                blocks.push(block);
            }
        }
        if blocks.is_empty() {
            // nothing on disk for this query; the snapshot drops here
            return Ok(Vec::new());
        }
        Ok(vec![Box::new(FileFilterResultSet::new(
            format!("file://{}", self.indicator),
            blocks,
            snapshot,
        ))])
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Drain any in-flight flush, synchronously flush what remains, then
    /// deregister from the manager. Fatal-or-complete: on a flush error
    /// the family stays registered and closable again.
    pub fn close(&self) -> Result<(), StorageError> {
        // stop admitting new flushes, then drain the one in flight
        self.cancel.cancel();
        self.flush_barrier.wait();

        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        if let Some(immutable) = state.immutable.clone() {
            let sequences = state.immutable_seq.clone().unwrap_or_default();
            self.flush_memdb(&sequences, immutable.as_ref())?;
            state.immutable = None;
            state.immutable_seq = None;
            self.commit_flushed(&mut state, &sequences);
        }
        if let Some(mutable) = state.mutable.clone() {
            let sequences = self.seq.snapshot();
            self.flush_memdb(&sequences, mutable.as_ref())?;
            state.mutable = None;
            self.commit_flushed(&mut state, &sequences);
        }
        state.closed = true;
        drop(state);

        self.manager.remove_family(&self.indicator);
        tracing::info!(family = %self.indicator, "data family closed");
        Ok(())
    }
}
