//! Query-side types: the per-shard query context and filter result sets.
//!
//! A family answers `filter` with zero or more result sets: one per
//! memory database that had matching points and one for the on-disk view.
//! The file result set owns the KV snapshot it reads from, so readers
//! stay valid until the caller drops the set.

use std::collections::HashMap;

use gale_common::timeutil::{SlotRange, TimeRange};
use gale_common::types::{FieldId, MetricId, SeriesId};

use crate::table::{FieldPoints, MetricBlock};

/// Query condition already narrowed to one metric within one shard.
/// Empty series/field lists select everything.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub metric_id: MetricId,
    pub series_ids: Vec<SeriesId>,
    pub field_ids: Vec<FieldId>,
    pub time_range: TimeRange,
}

impl QueryContext {
    pub fn all_series(metric_id: MetricId, time_range: TimeRange) -> Self {
        Self {
            metric_id,
            series_ids: Vec::new(),
            field_ids: Vec::new(),
            time_range,
        }
    }

    pub fn wants_series(&self, series_id: SeriesId) -> bool {
        self.series_ids.is_empty() || self.series_ids.contains(&series_id)
    }

    pub fn wants_field(&self, field_id: FieldId) -> bool {
        self.field_ids.is_empty() || self.field_ids.contains(&field_id)
    }
}

/// One source's worth of matching points.
pub trait FilterResultSet: Send {
    /// Where the points came from, for diagnostics.
    fn identifier(&self) -> &str;

    /// Slot window covered by this set.
    fn slot_range(&self) -> SlotRange;

    /// Points for `(series, field)`, sorted by slot, or `None`.
    fn load(&self, series_id: SeriesId, field_id: FieldId) -> Option<FieldPoints>;
}

/// Points copied out of a memory database under the family mutex.
pub struct MemoryFilterResultSet {
    identifier: String,
    slot_range: SlotRange,
    points: HashMap<(SeriesId, FieldId), FieldPoints>,
}

impl MemoryFilterResultSet {
    pub fn new(
        identifier: String,
        slot_range: SlotRange,
        points: HashMap<(SeriesId, FieldId), FieldPoints>,
    ) -> Self {
        Self {
            identifier,
            slot_range,
            points,
        }
    }
}

impl FilterResultSet for MemoryFilterResultSet {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn slot_range(&self) -> SlotRange {
        self.slot_range
    }

    fn load(&self, series_id: SeriesId, field_id: FieldId) -> Option<FieldPoints> {
        self.points.get(&(series_id, field_id)).cloned()
    }
}

/// Decoded blocks from the on-disk view. Holds the KV snapshot open for
/// as long as the set lives; dropping the set closes the snapshot.
pub struct FileFilterResultSet {
    identifier: String,
    slot_range: SlotRange,
    blocks: Vec<MetricBlock>,
    _snapshot: Box<dyn gale_kv::Snapshot>,
}

impl FileFilterResultSet {
    /// `blocks` must be non-empty; the slot range is their union.
    pub fn new(
        identifier: String,
        blocks: Vec<MetricBlock>,
        snapshot: Box<dyn gale_kv::Snapshot>,
    ) -> Self {
        let slot_range = blocks
            .iter()
            .map(|block| block.slot_range())
            .reduce(|acc, range| acc.union(&range))
            .unwrap_or(SlotRange::new(0, 0));
        Self {
            identifier,
            slot_range,
            blocks,
            _snapshot: snapshot,
        }
    }
}

impl FilterResultSet for FileFilterResultSet {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn slot_range(&self) -> SlotRange {
        self.slot_range
    }

    fn load(&self, series_id: SeriesId, field_id: FieldId) -> Option<FieldPoints> {
        // oldest file first; later flushes append after earlier ones
        let mut merged = Vec::new();
        for block in &self.blocks {
            if let Some(points) = block.load(series_id, field_id) {
                merged.extend_from_slice(points);
            }
        }
        if merged.is_empty() {
            None
        } else {
            Some(merged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_context_selection() {
        let mut ctx = QueryContext::all_series(1, TimeRange::new(0, 1000));
        assert!(ctx.wants_series(7));
        assert!(ctx.wants_field(2));

        ctx.series_ids = vec![1, 2];
        ctx.field_ids = vec![9];
        assert!(ctx.wants_series(2));
        assert!(!ctx.wants_series(7));
        assert!(ctx.wants_field(9));
        assert!(!ctx.wants_field(2));
    }

    #[test]
    fn test_memory_result_set_load() {
        let points = HashMap::from([((1u32, 2u16), vec![(0u16, 1.0), (3, 4.0)])]);
        let set = MemoryFilterResultSet::new(
            "memory://db/0".to_string(),
            SlotRange::new(0, 3),
            points,
        );
        assert_eq!(set.load(1, 2), Some(vec![(0, 1.0), (3, 4.0)]));
        assert!(set.load(1, 3).is_none());
        assert_eq!(set.slot_range(), SlotRange::new(0, 3));
    }
}
