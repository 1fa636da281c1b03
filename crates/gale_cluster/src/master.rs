//! Master controller: the single active coordinator of a cluster.
//!
//! The master wraps an [`Election`] whose listener is the inner
//! controller: fail-over constructs a fresh state-manager/state-machine
//! pair under the controller mutex, publishes the factory, and starts
//! it; a start failure unwinds everything and surfaces the error so the
//! election abandons the leadership and campaigns again. Resignation
//! stops the factory and closes the manager.
//!
//! Admin tasks are no-ops on non-masters: whichever node holds the lease
//! dispatches them.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use gale_common::error::ClusterError;

use crate::election::{Election, ElectionListener, MasterInfo, Node};
use crate::repo::Repository;
use crate::state::{StateMachineFactory, StateManager, StorageCluster as _};

/// Builds the state manager for a fresh term.
pub type StateManagerFn = Arc<dyn Fn() -> Arc<StateManager> + Send + Sync>;

/// Builds the state machine factory over a term's state manager.
pub type StateMachineFactoryFn =
    Arc<dyn Fn(Arc<StateManager>) -> Arc<dyn StateMachineFactory> + Send + Sync>;

/// Everything needed to run a master candidate.
pub struct MasterCfg {
    pub node: Node,
    pub repo: Arc<dyn Repository>,
    /// Repository path carrying the master lease.
    pub master_path: String,
    /// Lease TTL; renewed at roughly a third of this.
    pub ttl: Duration,
    pub state_manager_fn: StateManagerFn,
    pub state_machine_factory_fn: StateMachineFactoryFn,
}

/// Per-term state built on fail-over and torn down on resignation.
struct MasterTerm {
    state_mgr: Arc<StateManager>,
    state_machine_fct: Arc<dyn StateMachineFactory>,
}

struct MasterController {
    state_manager_fn: StateManagerFn,
    state_machine_factory_fn: StateMachineFactoryFn,
    term: Mutex<Option<MasterTerm>>,
}

impl ElectionListener for MasterController {
    fn on_fail_over(&self) -> Result<(), ClusterError> {
        tracing::info!("starting master fail over");
        let mut term = self.term.lock();

        let state_mgr = (self.state_manager_fn)();
        let state_machine_fct = (self.state_machine_factory_fn)(state_mgr.clone());
        // the manager must know its factory before the machines start
        state_mgr.set_state_machine_factory(state_machine_fct.clone());

        if let Err(err) = state_machine_fct.start() {
            state_machine_fct.stop();
            state_mgr.close();
            *term = None;
            return Err(ClusterError::StateMachine(format!(
                "start master state machine error: {err}"
            )));
        }

        *term = Some(MasterTerm {
            state_mgr,
            state_machine_fct,
        });
        Ok(())
    }

    fn on_resignation(&self) {
        tracing::info!("starting master resign");
        let mut term = self.term.lock();
        if let Some(term) = term.take() {
            term.state_machine_fct.stop();
            term.state_mgr.close();
        }
    }
}

/// Master candidate handle: start/stop the campaign, inspect the current
/// master, dispatch admin tasks when leading.
pub struct Master {
    controller: Arc<MasterController>,
    election: Election,
}

impl Master {
    pub fn new(cfg: MasterCfg) -> Self {
        let controller = Arc::new(MasterController {
            state_manager_fn: cfg.state_manager_fn,
            state_machine_factory_fn: cfg.state_machine_factory_fn,
            term: Mutex::new(None),
        });
        let election = Election::new(
            cfg.repo,
            cfg.node,
            cfg.master_path,
            cfg.ttl,
            controller.clone() as Arc<dyn ElectionListener>,
        );
        Self {
            controller,
            election,
        }
    }

    /// Start campaigning for the master lease.
    pub fn start(&self) -> Result<(), ClusterError> {
        self.election.initialize();
        self.election.elect()
    }

    /// Stop campaigning; resigns a held lease and tears the term down.
    pub fn stop(&self) {
        self.election.close();
    }

    pub fn is_master(&self) -> bool {
        self.election.is_master()
    }

    pub fn get_master(&self) -> Result<Option<MasterInfo>, ClusterError> {
        self.election.get_master()
    }

    /// Submit a flush of `database` on `cluster`. Non-masters succeed as
    /// a no-op; an unknown cluster is an error.
    pub fn flush_database(&self, cluster: &str, database: &str) -> Result<(), ClusterError> {
        if !self.is_master() {
            return Ok(());
        }
        let term = self.controller.term.lock();
        let storage = term
            .as_ref()
            .and_then(|term| term.state_mgr.storage_cluster(cluster));
        match storage {
            Some(storage) => storage.flush_database(database),
            None => Err(ClusterError::NoStorageCluster {
                name: cluster.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Instant;

    use crate::repo::MemoryRepository;
    use crate::state::StorageCluster;

    const TTL: Duration = Duration::from_millis(150);

    #[derive(Default)]
    struct StubCluster {
        flushed: Mutex<Vec<String>>,
    }

    impl StorageCluster for StubCluster {
        fn name(&self) -> &str {
            "west"
        }

        fn flush_database(&self, database: &str) -> Result<(), ClusterError> {
            self.flushed.lock().push(database.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubFactory {
        fail_start: AtomicBool,
        starts: AtomicU64,
        stops: AtomicU64,
    }

    impl StateMachineFactory for StubFactory {
        fn start(&self) -> Result<(), ClusterError> {
            if self.fail_start.load(Ordering::Acquire) {
                return Err(ClusterError::StateMachine("no discovery".to_string()));
            }
            self.starts.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn master_with(
        cluster: Arc<StubCluster>,
        factory: Arc<StubFactory>,
    ) -> Master {
        let repo = Arc::new(MemoryRepository::new());
        Master::new(MasterCfg {
            node: Node::new("host", 1),
            repo,
            master_path: "/master/node".to_string(),
            ttl: TTL,
            state_manager_fn: Arc::new(move || {
                let state_mgr = Arc::new(StateManager::new());
                state_mgr.register_cluster(cluster.clone());
                state_mgr
            }),
            state_machine_factory_fn: Arc::new(move |_state_mgr| {
                factory.clone() as Arc<dyn StateMachineFactory>
            }),
        })
    }

    #[test]
    fn test_flush_database_is_noop_off_master() {
        let cluster = Arc::new(StubCluster::default());
        let master = master_with(cluster.clone(), Arc::new(StubFactory::default()));
        // never started: not master
        master.flush_database("west", "metrics").unwrap();
        assert!(cluster.flushed.lock().is_empty());
    }

    #[test]
    fn test_flush_database_dispatches_when_master() {
        let cluster = Arc::new(StubCluster::default());
        let factory = Arc::new(StubFactory::default());
        let master = master_with(cluster.clone(), factory.clone());

        master.start().unwrap();
        wait_until(|| master.is_master());
        assert_eq!(factory.starts.load(Ordering::Relaxed), 1);
        assert_eq!(
            master.get_master().unwrap().unwrap().node,
            Node::new("host", 1)
        );

        master.flush_database("west", "metrics").unwrap();
        assert_eq!(cluster.flushed.lock().clone(), vec!["metrics".to_string()]);

        assert!(matches!(
            master.flush_database("east", "metrics"),
            Err(ClusterError::NoStorageCluster { name }) if name == "east"
        ));

        master.stop();
        assert_eq!(factory.stops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_failed_state_machine_start_unwinds_term() {
        let cluster = Arc::new(StubCluster::default());
        let factory = Arc::new(StubFactory::default());
        factory.fail_start.store(true, Ordering::Release);
        let master = master_with(cluster.clone(), factory.clone());

        master.start().unwrap();
        // every failed fail-over stops the factory and drops the term
        wait_until(|| factory.stops.load(Ordering::Relaxed) >= 2);
        assert!(master.controller.term.lock().is_none());
        assert_eq!(factory.starts.load(Ordering::Relaxed), 0);

        // once the collaborator recovers the next term sticks
        factory.fail_start.store(false, Ordering::Release);
        wait_until(|| master.is_master() && master.controller.term.lock().is_some());
        master.flush_database("west", "metrics").unwrap();
        assert_eq!(cluster.flushed.lock().clone(), vec!["metrics".to_string()]);

        master.stop();
    }

    #[test]
    fn test_stop_tears_down_and_releases_lease() {
        let cluster = Arc::new(StubCluster::default());
        let factory = Arc::new(StubFactory::default());
        let master = master_with(cluster, factory.clone());
        master.start().unwrap();
        wait_until(|| master.is_master());

        master.stop();
        assert!(!master.is_master());
        assert!(master.get_master().unwrap().is_none());
        assert!(master.controller.term.lock().is_none());
        assert_eq!(factory.stops.load(Ordering::Relaxed), 1);
    }
}
