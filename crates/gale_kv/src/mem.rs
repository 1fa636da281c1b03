//! In-memory KV family.
//!
//! Backs single-process mode and the storage tests: flushed batches become
//! immutable in-memory files, the sequence footer is merged with max() per
//! leader, and snapshots clone the file list so they stay stable while
//! later flushes land.
//!
//! Failure paths are exercised through two injection hooks: a one-shot
//! `fail_next_flush` (commit returns an IO error once) and a `flush_delay`
//! applied inside commit (holds a flush open so drain paths can be driven).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use gale_common::error::KvError;
use gale_common::types::{LeaderId, MetricId, SeqNo};

use crate::{Family, Flusher, Reader, Snapshot};

/// One immutable flushed file.
struct MemoryFile {
    path: String,
    entries: HashMap<MetricId, Vec<u8>>,
}

impl Reader for MemoryFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn get(&self, key: MetricId) -> Option<Vec<u8>> {
        self.entries.get(&key).cloned()
    }
}

#[derive(Default)]
struct FamilyState {
    files: Vec<Arc<MemoryFile>>,
    sequences: HashMap<LeaderId, SeqNo>,
}

struct Shared {
    name: String,
    state: RwLock<FamilyState>,
    next_file_id: AtomicU64,
    fail_next_flush: AtomicBool,
    flush_delay: Mutex<Option<Duration>>,
}

/// In-memory [`Family`] implementation.
pub struct MemoryFamily {
    shared: Arc<Shared>,
}

impl MemoryFamily {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: RwLock::new(FamilyState::default()),
                next_file_id: AtomicU64::new(1),
                fail_next_flush: AtomicBool::new(false),
                flush_delay: Mutex::new(None),
            }),
        }
    }

    /// Seed the sequence footer, as if recovered from a prior run.
    pub fn with_sequences(name: impl Into<String>, sequences: HashMap<LeaderId, SeqNo>) -> Self {
        let family = Self::new(name);
        family.shared.state.write().sequences = sequences;
        family
    }

    /// Make the next `commit` fail with an IO error, once.
    pub fn fail_next_flush(&self) {
        self.shared.fail_next_flush.store(true, Ordering::SeqCst);
    }

    /// Hold every commit open for `delay` before it publishes.
    pub fn set_flush_delay(&self, delay: Option<Duration>) {
        *self.shared.flush_delay.lock() = delay;
    }

    /// Number of flushed files.
    pub fn file_count(&self) -> usize {
        self.shared.state.read().files.len()
    }
}

impl Family for MemoryFamily {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn new_flusher(&self) -> Box<dyn Flusher> {
        Box::new(MemoryFlusher {
            shared: self.shared.clone(),
            entries: HashMap::new(),
            sequences: HashMap::new(),
            committed: false,
        })
    }

    fn get_snapshot(&self) -> Box<dyn Snapshot> {
        let state = self.shared.state.read();
        Box::new(MemorySnapshot {
            files: state.files.clone(),
            sequences: state.sequences.clone(),
        })
    }
}

struct MemoryFlusher {
    shared: Arc<Shared>,
    entries: HashMap<MetricId, Vec<u8>>,
    sequences: HashMap<LeaderId, SeqNo>,
    committed: bool,
}

impl Flusher for MemoryFlusher {
    fn sequence(&mut self, leader: LeaderId, seq: SeqNo) {
        self.sequences.insert(leader, seq);
    }

    fn add(&mut self, key: MetricId, block: Vec<u8>) -> Result<(), KvError> {
        if self.committed {
            return Err(KvError::Closed);
        }
        self.entries.insert(key, block);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), KvError> {
        if self.committed {
            return Err(KvError::Closed);
        }
        let delay = *self.shared.flush_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.shared.fail_next_flush.swap(false, Ordering::SeqCst) {
            return Err(KvError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected flush failure",
            )));
        }

        let file_id = self.shared.next_file_id.fetch_add(1, Ordering::Relaxed);
        let file = Arc::new(MemoryFile {
            path: format!("mem://{}/{:06}.dat", self.shared.name, file_id),
            entries: std::mem::take(&mut self.entries),
        });

        let mut state = self.shared.state.write();
        state.files.push(file);
        for (leader, seq) in self.sequences.drain() {
            let entry = state.sequences.entry(leader).or_insert(seq);
            *entry = (*entry).max(seq);
        }
        self.committed = true;
        tracing::debug!(family = %self.shared.name, file_id, "memory family flush committed");
        Ok(())
    }
}

struct MemorySnapshot {
    files: Vec<Arc<MemoryFile>>,
    sequences: HashMap<LeaderId, SeqNo>,
}

impl Snapshot for MemorySnapshot {
    fn sequences(&self) -> HashMap<LeaderId, SeqNo> {
        self.sequences.clone()
    }

    fn find_readers(&self, key: MetricId) -> Result<Vec<Arc<dyn Reader>>, KvError> {
        Ok(self
            .files
            .iter()
            .filter(|file| file.entries.contains_key(&key))
            .map(|file| file.clone() as Arc<dyn Reader>)
            .collect())
    }
}
