//! Cluster coordination: lease-based master election over a coordinator
//! repository, and the master controller that owns post-election state
//! machines and dispatches administrative tasks (such as flush-database)
//! to storage clusters.

pub mod election;
pub mod master;
pub mod repo;
pub mod state;

pub use election::{Election, ElectionListener, MasterInfo, Node};
pub use master::{Master, MasterCfg};
pub use repo::{MemoryRepository, Repository};
pub use state::{StateMachineFactory, StateManager, StorageCluster};
