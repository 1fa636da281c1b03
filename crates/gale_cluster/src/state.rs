//! Post-election master state: the storage-cluster registry and the
//! state-machine lifecycle hooks.
//!
//! Both are rebuilt on every fail-over and torn down on resignation, so
//! a re-elected master never sees stale cluster state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use gale_common::error::ClusterError;

/// One storage cluster the master can dispatch admin tasks to.
pub trait StorageCluster: Send + Sync {
    fn name(&self) -> &str;

    /// Submit a flush of `database` across the cluster.
    fn flush_database(&self, database: &str) -> Result<(), ClusterError>;
}

/// Cluster-coordination state machines started when this node becomes
/// master and stopped when it resigns.
pub trait StateMachineFactory: Send + Sync {
    fn start(&self) -> Result<(), ClusterError>;
    fn stop(&self);
}

/// Registry of storage clusters owned by the active master. Closed (and
/// dropped) on resignation.
#[derive(Default)]
pub struct StateManager {
    clusters: RwLock<HashMap<String, Arc<dyn StorageCluster>>>,
    state_machine_fct: Mutex<Option<Arc<dyn StateMachineFactory>>>,
    closed: AtomicBool,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_cluster(&self, cluster: Arc<dyn StorageCluster>) {
        self.clusters
            .write()
            .insert(cluster.name().to_string(), cluster);
    }

    pub fn storage_cluster(&self, name: &str) -> Option<Arc<dyn StorageCluster>> {
        self.clusters.read().get(name).cloned()
    }

    /// Publish the factory driving this manager's state machines; set
    /// before the factory starts.
    pub fn set_state_machine_factory(&self, factory: Arc<dyn StateMachineFactory>) {
        *self.state_machine_fct.lock() = Some(factory);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.clusters.write().clear();
        *self.state_machine_fct.lock() = None;
        tracing::info!("master state manager closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedCluster(&'static str);

    impl StorageCluster for NamedCluster {
        fn name(&self) -> &str {
            self.0
        }

        fn flush_database(&self, _database: &str) -> Result<(), ClusterError> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let manager = StateManager::new();
        manager.register_cluster(Arc::new(NamedCluster("west")));
        assert!(manager.storage_cluster("west").is_some());
        assert!(manager.storage_cluster("east").is_none());
    }

    #[test]
    fn test_close_clears_registry() {
        let manager = StateManager::new();
        manager.register_cluster(Arc::new(NamedCluster("west")));
        assert!(!manager.is_closed());
        manager.close();
        assert!(manager.is_closed());
        assert!(manager.storage_cluster("west").is_none());
        // idempotent
        manager.close();
    }
}
