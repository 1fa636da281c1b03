//! Shared identifier types used across the storage and cluster crates.

/// Replication leader id. Each write batch is stamped by exactly one leader.
pub type LeaderId = i32;

/// Per-leader monotonic write sequence.
pub type SeqNo = i64;

/// Shard id within a database.
pub type ShardId = u32;

/// Metric id (pre-resolved by the upstream tagging pipeline).
pub type MetricId = u32;

/// Series id within a metric.
pub type SeriesId = u32;

/// Field id within a metric.
pub type FieldId = u16;
