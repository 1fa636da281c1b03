//! Per-leader replication sequence table.
//!
//! Replication delivers write batches tagged with a leader id and a
//! monotonically increasing sequence. The table keeps the highest
//! committed sequence per leader so duplicates and out-of-order retries
//! can be rejected before they touch the memory database.
//!
//! Values live in `Arc<AtomicI64>` cells so readers outside the family
//! mutex see a consistent number without taking the map lock for long.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use gale_common::types::{LeaderId, SeqNo};

/// Mapping `leader → highest sequence`.
#[derive(Debug, Default)]
pub struct SequenceTable {
    current: RwLock<HashMap<LeaderId, Arc<AtomicI64>>>,
}

impl SequenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `seq` is newer than everything committed for `leader`.
    /// An unknown leader accepts any sequence.
    pub fn validate(&self, leader: LeaderId, seq: SeqNo) -> bool {
        match self.current.read().get(&leader) {
            Some(cell) => seq > cell.load(Ordering::Acquire),
            None => true,
        }
    }

    /// Record `seq` for `leader`. Callers must have validated.
    pub fn commit(&self, leader: LeaderId, seq: SeqNo) {
        if let Some(cell) = self.current.read().get(&leader) {
            cell.store(seq, Ordering::Release);
            return;
        }
        self.current
            .write()
            .entry(leader)
            .or_insert_with(|| Arc::new(AtomicI64::new(seq)))
            .store(seq, Ordering::Release);
    }

    /// Advance `leader` to at least `seq`, never regressing a value a
    /// concurrent committer already moved past.
    pub fn confirm(&self, leader: LeaderId, seq: SeqNo) {
        if let Some(cell) = self.current.read().get(&leader) {
            cell.fetch_max(seq, Ordering::AcqRel);
            return;
        }
        self.current
            .write()
            .entry(leader)
            .or_insert_with(|| Arc::new(AtomicI64::new(seq)))
            .fetch_max(seq, Ordering::AcqRel);
    }

    pub fn get(&self, leader: LeaderId) -> Option<SeqNo> {
        self.current
            .read()
            .get(&leader)
            .map(|cell| cell.load(Ordering::Acquire))
    }

    /// Atomic copy of all current values.
    pub fn snapshot(&self) -> HashMap<LeaderId, SeqNo> {
        self.current
            .read()
            .iter()
            .map(|(leader, cell)| (*leader, cell.load(Ordering::Acquire)))
            .collect()
    }

    /// Overwrite the whole table; used to seed from the persisted footer
    /// when a family opens.
    pub fn restore(&self, values: HashMap<LeaderId, SeqNo>) {
        let mut current = self.current.write();
        current.clear();
        for (leader, seq) in values {
            current.insert(leader, Arc::new(AtomicI64::new(seq)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_leader_validates() {
        let table = SequenceTable::new();
        assert!(table.validate(1, 0));
        assert!(table.validate(1, -5));
    }

    #[test]
    fn test_validate_rejects_replay() {
        let table = SequenceTable::new();
        table.commit(1, 10);
        assert!(!table.validate(1, 10));
        assert!(!table.validate(1, 9));
        assert!(table.validate(1, 11));
        // repeated calls are pure until the state changes
        assert!(!table.validate(1, 10));
        table.commit(1, 12);
        assert!(!table.validate(1, 11));
        assert!(table.validate(1, 13));
    }

    #[test]
    fn test_snapshot_and_restore() {
        let table = SequenceTable::new();
        table.commit(1, 5);
        table.commit(2, 9);
        let snap = table.snapshot();
        assert_eq!(snap, HashMap::from([(1, 5), (2, 9)]));

        let other = SequenceTable::new();
        other.restore(snap);
        assert_eq!(other.get(1), Some(5));
        assert_eq!(other.get(2), Some(9));
        assert_eq!(other.get(3), None);
    }

    #[test]
    fn test_confirm_never_regresses() {
        let table = SequenceTable::new();
        table.commit(1, 20);
        // the flush snapshot was taken earlier at 15
        table.confirm(1, 15);
        assert_eq!(table.get(1), Some(20));
        table.confirm(1, 25);
        assert_eq!(table.get(1), Some(25));
        // confirm on an unknown leader installs the value
        table.confirm(2, 7);
        assert_eq!(table.get(2), Some(7));
    }
}
