//! Error hierarchy shared by the storage and cluster crates.
//!
//! Each layer has its own enum; everything converges into [`GaleError`]
//! for callers that cross layers. Per-row write failures are counted and
//! logged at the call site and never abort a batch; the variants here are
//! the ones that surface to callers.

use thiserror::Error;

/// Convenience alias for `Result<T, GaleError>`.
pub type GaleResult<T> = Result<T, GaleError>;

/// Top-level error all layer errors convert into.
#[derive(Error, Debug)]
pub enum GaleError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("KV error: {0}")]
    Kv(#[from] KvError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// KV store layer errors.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted block: {0}")]
    Corrupted(String),

    #[error("Family closed")]
    Closed,
}

/// Time-series storage layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Memory database construction failed; the whole batch is dropped.
    #[error("Create memory database error: {0}")]
    MemDbCreate(String),

    /// Write hit a memory database already promoted for flushing.
    /// Counted per row; never aborts the batch.
    #[error("Memory database is read-only")]
    MemDbReadOnly,

    /// Disk write failed mid-flush. The immutable memory database is
    /// retained so the next flush (or close) retries it.
    #[error("Flush write error: {0}")]
    FlushWrite(#[source] KvError),

    /// Operation on a family that has already been closed.
    #[error("Data family closed")]
    FamilyClosed,

    #[error("KV error: {0}")]
    Kv(#[from] KvError),
}

/// Cluster coordination layer errors.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// The master was asked to act on a storage cluster it does not know.
    #[error("Storage cluster not found: {name}")]
    NoStorageCluster { name: String },

    #[error("Election error: {0}")]
    Election(String),

    #[error("State machine error: {0}")]
    StateMachine(String),

    #[error("Repository error: {0}")]
    Repository(#[from] RepoError),
}

/// Coordinator repository errors.
#[derive(Error, Debug)]
pub enum RepoError {
    /// Lease renewal attempted by a node that no longer owns the lease.
    #[error("Not the lease owner")]
    NotOwner,

    #[error("Repository store error: {0}")]
    Store(String),
}
