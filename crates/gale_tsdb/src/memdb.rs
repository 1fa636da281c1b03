//! In-memory row buffer for one family window.
//!
//! Rows are keyed metric → series → field → slot in nested `BTreeMap`s so
//! a flush streams them out in key order. Writers run under the shared
//! side of a writer barrier; `mark_read_only` takes the exclusive side,
//! so promotion to immutable can never interleave with an in-flight
//! batch. Read-only is a one-way transition: after it, only `filter`,
//! `flush_to` and `close` are valid.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use gale_common::error::{KvError, StorageError};
use gale_common::timeutil::SlotRange;
use gale_common::types::{FieldId, MetricId, SeriesId};

use crate::buffer::BufferManager;
use crate::filter::{FilterResultSet, MemoryFilterResultSet, QueryContext};
use crate::row::StorageRow;
use crate::table::MetricDataFlusher;

/// Construction parameters handed to a [`MemDbFactory`].
pub struct MemoryDatabaseCfg {
    pub family_time: i64,
    pub name: String,
    pub buffer: Arc<BufferManager>,
}

/// Injectable memory database constructor. Families take one so tests can
/// substitute failing or instrumented implementations.
pub type MemDbFactory =
    Arc<dyn Fn(MemoryDatabaseCfg) -> Result<Arc<dyn MemoryDatabase>, StorageError> + Send + Sync>;

/// The default factory, producing [`MemoryDatabaseImpl`].
pub fn default_memdb_factory() -> MemDbFactory {
    Arc::new(|cfg| Ok(Arc::new(MemoryDatabaseImpl::new(cfg))))
}

/// Scoped writer admission. Holding the guard keeps `mark_read_only`
/// waiting; dropping it releases the batch on every exit path.
pub struct WriteGuard<'a> {
    _guard: Option<RwLockReadGuard<'a, ()>>,
}

impl WriteGuard<'_> {
    /// Guard tied to no barrier, for stub implementations.
    pub fn detached() -> WriteGuard<'static> {
        WriteGuard { _guard: None }
    }
}

/// In-memory row buffer contract consumed by the data family.
pub trait MemoryDatabase: Send + Sync {
    /// Enter the writer section for one batch.
    fn acquire_write(&self) -> WriteGuard<'_>;

    /// Buffer one row; returns the appended byte estimate. Fails once the
    /// memory database has been marked read-only.
    fn write_row(&self, row: &StorageRow) -> Result<u64, StorageError>;

    /// One-way transition; waits for in-flight writer sections to drain.
    fn mark_read_only(&self);

    fn is_read_only(&self) -> bool;

    /// Buffered row count.
    fn size(&self) -> u64;

    /// Heap estimate in bytes.
    fn mem_size(&self) -> u64;

    /// Wall time since the first buffered write; zero while empty.
    fn uptime(&self) -> Duration;

    fn filter(&self, ctx: &QueryContext) -> Result<Vec<Box<dyn FilterResultSet>>, StorageError>;

    /// Stream all buffered rows into `flusher` in key order.
    fn flush_to(&self, flusher: &mut dyn MetricDataFlusher) -> Result<(), KvError>;

    /// Release buffer accounting. Idempotent.
    fn close(&self) -> Result<(), StorageError>;
}

type SlotValues = BTreeMap<u16, f64>;
type FieldStore = BTreeMap<FieldId, SlotValues>;
type SeriesStore = BTreeMap<SeriesId, FieldStore>;
type MetricStore = BTreeMap<MetricId, SeriesStore>;

// heap estimates per newly created map level / point
const NEW_METRIC_BYTES: u64 = 48;
const NEW_SERIES_BYTES: u64 = 32;
const NEW_FIELD_BYTES: u64 = 24;
const POINT_BYTES: u64 = 10;

/// Default [`MemoryDatabase`] implementation.
pub struct MemoryDatabaseImpl {
    name: String,
    family_time: i64,
    buffer: Arc<BufferManager>,

    /// Writer barrier: writers hold the shared side per batch,
    /// `mark_read_only` the exclusive side.
    barrier: RwLock<()>,
    read_only: AtomicBool,

    rows: RwLock<MetricStore>,
    row_count: AtomicU64,
    approx_bytes: AtomicU64,
    first_write_at: Mutex<Option<Instant>>,
    closed: AtomicBool,
}

impl MemoryDatabaseImpl {
    pub fn new(cfg: MemoryDatabaseCfg) -> Self {
        Self {
            name: cfg.name,
            family_time: cfg.family_time,
            buffer: cfg.buffer,
            barrier: RwLock::new(()),
            read_only: AtomicBool::new(false),
            rows: RwLock::new(MetricStore::new()),
            row_count: AtomicU64::new(0),
            approx_bytes: AtomicU64::new(0),
            first_write_at: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn identifier(&self) -> String {
        format!("memory://{}/{}", self.name, self.family_time)
    }
}

impl MemoryDatabase for MemoryDatabaseImpl {
    fn acquire_write(&self) -> WriteGuard<'_> {
        WriteGuard {
            _guard: Some(self.barrier.read()),
        }
    }

    fn write_row(&self, row: &StorageRow) -> Result<u64, StorageError> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(StorageError::MemDbReadOnly);
        }

        let mut appended = 0u64;
        {
            let mut rows = self.rows.write();
            let series_store = rows.entry(row.metric_id).or_insert_with(|| {
                appended += NEW_METRIC_BYTES;
                SeriesStore::new()
            });
            let field_store = series_store.entry(row.series_id).or_insert_with(|| {
                appended += NEW_SERIES_BYTES;
                FieldStore::new()
            });
            for field in &row.fields {
                let slots = field_store.entry(field.field_id).or_insert_with(|| {
                    appended += NEW_FIELD_BYTES;
                    SlotValues::new()
                });
                // last write wins within a slot
                if slots.insert(row.slot_index, field.value).is_none() {
                    appended += POINT_BYTES;
                }
            }
        }

        if appended > 0 {
            self.approx_bytes.fetch_add(appended, Ordering::Relaxed);
            self.buffer.charge(appended);
        }
        self.row_count.fetch_add(1, Ordering::Relaxed);
        self.first_write_at.lock().get_or_insert_with(Instant::now);
        Ok(appended)
    }

    fn mark_read_only(&self) {
        let _barrier = self.barrier.write();
        self.read_only.store(true, Ordering::Release);
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    fn size(&self) -> u64 {
        self.row_count.load(Ordering::Relaxed)
    }

    fn mem_size(&self) -> u64 {
        self.approx_bytes.load(Ordering::Relaxed)
    }

    fn uptime(&self) -> Duration {
        match *self.first_write_at.lock() {
            Some(at) => at.elapsed(),
            None => Duration::ZERO,
        }
    }

    fn filter(&self, ctx: &QueryContext) -> Result<Vec<Box<dyn FilterResultSet>>, StorageError> {
        let rows = self.rows.read();
        let Some(series_store) = rows.get(&ctx.metric_id) else {
            return Ok(Vec::new());
        };

        let mut points: HashMap<(SeriesId, FieldId), Vec<(u16, f64)>> = HashMap::new();
        let mut slot_start = u16::MAX;
        let mut slot_end = 0u16;
        for (series_id, field_store) in series_store {
            if !ctx.wants_series(*series_id) {
                continue;
            }
            for (field_id, slots) in field_store {
                if !ctx.wants_field(*field_id) {
                    continue;
                }
                let collected: Vec<(u16, f64)> =
                    slots.iter().map(|(slot, value)| (*slot, *value)).collect();
                if let (Some((first, _)), Some((last, _))) =
                    (collected.first(), collected.last())
                {
                    slot_start = slot_start.min(*first);
                    slot_end = slot_end.max(*last);
                    points.insert((*series_id, *field_id), collected);
                }
            }
        }

        if points.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Box::new(MemoryFilterResultSet::new(
            self.identifier(),
            SlotRange::new(slot_start, slot_end),
            points,
        ))])
    }

    fn flush_to(&self, flusher: &mut dyn MetricDataFlusher) -> Result<(), KvError> {
        let rows = self.rows.read();
        for (metric_id, series_store) in rows.iter() {
            for (series_id, field_store) in series_store {
                for (field_id, slots) in field_store {
                    let points: Vec<(u16, f64)> =
                        slots.iter().map(|(slot, value)| (*slot, *value)).collect();
                    flusher.flush_field(*field_id, &points)?;
                }
                flusher.flush_series(*series_id)?;
            }
            flusher.flush_metric(*metric_id)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.buffer.release(self.approx_bytes.load(Ordering::Relaxed));
        }
        Ok(())
    }
}
