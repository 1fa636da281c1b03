//! KV store family surface consumed by the time-series core.
//!
//! A family is one column-family-like unit of the underlying KV store.
//! Writers obtain a [`Flusher`], stage metric blocks plus the per-leader
//! sequence footer, and publish everything atomically with `commit`.
//! Dropping an uncommitted flusher discards the staged batch, so every
//! exit path releases its resources.
//!
//! Readers obtain a [`Snapshot`]: an immutable view of the flushed files
//! and the current sequence footer. A snapshot stays readable for as long
//! as it is held; dropping it closes the view.

use std::collections::HashMap;
use std::sync::Arc;

use gale_common::error::KvError;
use gale_common::types::{LeaderId, MetricId, SeqNo};

pub mod mem;

/// One KV family: named storage unit holding flushed metric blocks and a
/// per-leader sequence footer.
pub trait Family: Send + Sync {
    fn name(&self) -> &str;

    /// Stage a new flush batch. The batch becomes visible only on
    /// [`Flusher::commit`].
    fn new_flusher(&self) -> Box<dyn Flusher>;

    /// Immutable read view of the flushed state.
    fn get_snapshot(&self) -> Box<dyn Snapshot>;
}

/// Write batch for one flush. Everything staged here is invisible until
/// `commit` returns; a dropped, uncommitted flusher publishes nothing.
pub trait Flusher: Send {
    /// Record a per-leader sequence in the batch footer.
    fn sequence(&mut self, leader: LeaderId, seq: SeqNo);

    /// Stage one metric block under its metric key.
    fn add(&mut self, key: MetricId, block: Vec<u8>) -> Result<(), KvError>;

    /// Atomically publish the staged blocks and footer.
    fn commit(&mut self) -> Result<(), KvError>;
}

/// Immutable view of a family's flushed files and sequence footer.
pub trait Snapshot: Send {
    /// The current version's per-leader sequences.
    fn sequences(&self) -> HashMap<LeaderId, SeqNo>;

    /// Readers for every flushed file that contains the metric key,
    /// oldest first.
    fn find_readers(&self, key: MetricId) -> Result<Vec<Arc<dyn Reader>>, KvError>;
}

/// Read access to one flushed file.
pub trait Reader: Send + Sync {
    /// Identifier of the underlying file, for diagnostics.
    fn path(&self) -> &str;

    /// The metric block stored under `key`, if present in this file.
    fn get(&self, key: MetricId) -> Option<Vec<u8>>;
}
