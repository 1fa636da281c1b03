//! Metric row as it arrives at a data family.
//!
//! Rows are produced by the upstream write pipeline: metric, series and
//! field ids are already resolved and the row has been routed to the
//! family window that covers its timestamp. The family only computes the
//! slot index before handing the row to the memory database.

use gale_common::types::{FieldId, MetricId, SeriesId};

/// One field value inside a row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldValue {
    pub field_id: FieldId,
    pub value: f64,
}

/// A single metric row routed to one family window.
#[derive(Debug, Clone)]
pub struct StorageRow {
    pub metric_id: MetricId,
    pub series_id: SeriesId,
    /// Epoch milliseconds; guaranteed inside the family window.
    pub timestamp: i64,
    /// Sentinel from the upstream decoder. Non-writable rows are counted
    /// as failures and skipped.
    pub writable: bool,
    /// Slot inside the family window; assigned by the family on write.
    pub slot_index: u16,
    pub fields: Vec<FieldValue>,
}

impl StorageRow {
    pub fn new(
        metric_id: MetricId,
        series_id: SeriesId,
        timestamp: i64,
        fields: Vec<FieldValue>,
    ) -> Self {
        Self {
            metric_id,
            series_id,
            timestamp,
            writable: true,
            slot_index: 0,
            fields,
        }
    }
}
