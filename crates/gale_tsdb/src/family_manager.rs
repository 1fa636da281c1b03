//! Process-wide registry of live data families.
//!
//! Families register themselves at creation and deregister in `close`;
//! the manager holds strong references purely so admin tasks and the
//! flush checker can enumerate live families, and releases them on
//! remove. It never drives a family's lifecycle.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::family::DataFamily;

/// Registry of active families indexed by indicator
/// (`database/shard/family_time`).
#[derive(Default)]
pub struct FamilyManager {
    families: DashMap<String, Arc<DataFamily>>,
}

impl FamilyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_family(&self, family: Arc<DataFamily>) {
        self.families
            .insert(family.indicator().to_string(), family);
    }

    pub fn remove_family(&self, indicator: &str) {
        self.families.remove(indicator);
    }

    pub fn get_family(&self, indicator: &str) -> Option<Arc<DataFamily>> {
        self.families.get(indicator).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, indicator: &str) -> bool {
        self.families.contains_key(indicator)
    }

    pub fn family_count(&self) -> usize {
        self.families.len()
    }

    /// Visit every live family. The set is copied out first, so the
    /// callback may add or remove families without deadlocking the walk.
    pub fn walk<F: FnMut(&Arc<DataFamily>)>(&self, mut f: F) {
        let families: Vec<Arc<DataFamily>> = self
            .families
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for family in &families {
            f(family);
        }
    }
}

static GLOBAL_FAMILY_MANAGER: OnceLock<Arc<FamilyManager>> = OnceLock::new();

/// The process-wide default manager. Families accept a manager as a
/// constructor parameter; embedders that want one registry per process
/// pass this.
pub fn family_manager() -> Arc<FamilyManager> {
    GLOBAL_FAMILY_MANAGER
        .get_or_init(|| Arc::new(FamilyManager::new()))
        .clone()
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
    use crate::shard::Shard;

    struct TestShard;

    impl Shard for TestShard {
        fn database_name(&self) -> &str {
            "metrics"
        }

        fn shard_id(&self) -> ShardId {
            1
        }

        fn buffer_manager(&self) -> Arc<BufferManager> {
            Arc::new(BufferManager::new())
        }
    }

    fn open_family(manager: &Arc<FamilyManager>, family_time: i64) -> Arc<DataFamily> {
        DataFamily::new(
            Arc::new(TestShard),
            Interval::from_secs(10),
            TimeRange::new(family_time, family_time + 3_600_000),
            family_time,
            Arc::new(MemoryFamily::new("kv")),
            TsdbConfig::default(),
            manager.clone(),
        )
    }

    #[test]
    fn test_families_register_on_create_and_deregister_on_close() {
        let manager = Arc::new(FamilyManager::new());
        let family = open_family(&manager, 0);
        assert_eq!(manager.family_count(), 1);
        assert!(manager.contains(family.indicator()));
        assert!(manager.get_family(family.indicator()).is_some());

        family.close().unwrap();
        assert_eq!(manager.family_count(), 0);
        assert!(!manager.contains(family.indicator()));
        assert!(manager.get_family(family.indicator()).is_none());
    }

    #[test]
    fn test_walk_visits_every_family() {
        let manager = Arc::new(FamilyManager::new());
        let first = open_family(&manager, 0);
        let second = open_family(&manager, 3_600_000);

        let mut seen = Vec::new();
        manager.walk(|family| seen.push(family.indicator().to_string()));
        seen.sort();
        let mut expected = vec![
            first.indicator().to_string(),
            second.indicator().to_string(),
        ];
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_walk_callback_may_remove() {
        let manager = Arc::new(FamilyManager::new());
        open_family(&manager, 0);
        open_family(&manager, 3_600_000);

        // closing from inside the walk must not deadlock the registry
        manager.walk(|family| family.close().unwrap());
        assert_eq!(manager.family_count(), 0);
    }

    #[test]
    fn test_concurrent_add_remove_walk() {
        let manager = Arc::new(FamilyManager::new());
        let mut handles = Vec::new();
        for thread in 0..4i64 {
            let manager = manager.clone();
            handles.push(std::thread::spawn(move || {
                for round in 0..20 {
                    let family =
                        open_family(&manager, (thread * 100 + round) * 3_600_000);
                    manager.walk(|family| {
                        let _ = family.indicator();
                    });
                    family.close().unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(manager.family_count(), 0);
    }

    #[test]
    fn test_process_wide_manager_is_shared() {
        let first = family_manager();
        let second = family_manager();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
