//! Lease-based single-leader election.
//!
//! One well-known repository key carries the master lease. The campaign
//! thread ticks at roughly a third of the TTL: a non-master tries to
//! acquire the lease and, on success, runs the listener's fail-over; a
//! master renews its lease and treats any renewal failure as a
//! resignation, after which it campaigns again. `close` resigns a held
//! lease so the next node can take over without waiting out the TTL.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use gale_common::cancel::CancelToken;
use gale_common::error::ClusterError;

use crate::repo::Repository;

/// A cluster node's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
    pub port: u16,
}

impl Node {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    pub fn id(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// The payload published under the master lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterInfo {
    pub node: Node,
    pub elect_time_ms: i64,
}

/// Hooks invoked by the election on leadership changes.
pub trait ElectionListener: Send + Sync {
    /// The local node just won the lease. An error here abandons the
    /// leadership: the election resigns and campaigns again.
    fn on_fail_over(&self) -> Result<(), ClusterError>;

    /// The local node held the lease and lost or relinquished it.
    fn on_resignation(&self);
}

struct ElectionInner {
    repo: Arc<dyn Repository>,
    node: Node,
    key: String,
    ttl: Duration,
    listener: Arc<dyn ElectionListener>,
    is_master: AtomicBool,
    cancel: CancelToken,
}

impl ElectionInner {
    fn try_elect(&self) -> Result<bool, ClusterError> {
        let info = MasterInfo {
            node: self.node.clone(),
            elect_time_ms: now_ms(),
        };
        let payload = serde_json::to_vec(&info)
            .map_err(|err| ClusterError::Election(format!("encode master info: {err}")))?;
        Ok(self
            .repo
            .try_acquire(&self.key, &self.node.id(), payload, self.ttl)?)
    }

    fn campaign(&self) {
        // renew at roughly a third of the TTL
        let tick = self.ttl / 3;
        loop {
            if self.is_master.load(Ordering::Acquire) {
                if let Err(err) = self.repo.keep_alive(&self.key, &self.node.id()) {
                    tracing::warn!(
                        node = %self.node.id(),
                        error = %err,
                        "master lease renewal failed, resigning"
                    );
                    self.is_master.store(false, Ordering::Release);
                    self.listener.on_resignation();
                }
            } else {
                match self.try_elect() {
                    Ok(true) => {
                        tracing::info!(node = %self.node.id(), "elected as master");
                        // mastership is observable only once fail over
                        // completed; a failed fail over abandons the lease
                        match self.listener.on_fail_over() {
                            Ok(()) => {
                                self.is_master.store(true, Ordering::Release);
                            }
                            Err(err) => {
                                tracing::error!(
                                    node = %self.node.id(),
                                    error = %err,
                                    "master fail over failed, abandoning leadership"
                                );
                                if let Err(err) = self.repo.resign(&self.key, &self.node.id()) {
                                    tracing::warn!(error = %err, "resign after failed fail over");
                                }
                            }
                        }
                    }
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(node = %self.node.id(), error = %err, "elect attempt failed");
                    }
                }
            }
            if self.cancel.wait_for(tick) {
                return;
            }
        }
    }
}

/// Single-leader election over a [`Repository`] lease.
pub struct Election {
    inner: Arc<ElectionInner>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Election {
    pub fn new(
        repo: Arc<dyn Repository>,
        node: Node,
        key: impl Into<String>,
        ttl: Duration,
        listener: Arc<dyn ElectionListener>,
    ) -> Self {
        Self {
            inner: Arc::new(ElectionInner {
                repo,
                node,
                key: key.into(),
                ttl,
                listener,
                is_master: AtomicBool::new(false),
                cancel: CancelToken::new(),
            }),
            join_handle: Mutex::new(None),
        }
    }

    /// Log the current cluster master, if any. Called once before
    /// campaigning.
    pub fn initialize(&self) {
        match self.get_master() {
            Ok(Some(master)) => {
                tracing::info!(master = %master.node.id(), "current cluster master");
            }
            Ok(None) => {
                tracing::info!("no cluster master yet");
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to read current master");
            }
        }
    }

    /// Start campaigning in the background. Idempotent.
    pub fn elect(&self) -> Result<(), ClusterError> {
        let mut join_handle = self.join_handle.lock();
        if join_handle.is_some() {
            return Ok(());
        }
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("gale-master-elect".to_string())
            .spawn(move || inner.campaign())
            .map_err(|err| {
                ClusterError::Election(format!("failed to spawn campaign thread: {err}"))
            })?;
        *join_handle = Some(handle);
        Ok(())
    }

    pub fn is_master(&self) -> bool {
        self.inner.is_master.load(Ordering::Acquire)
    }

    /// The current cluster master, read from the repository.
    pub fn get_master(&self) -> Result<Option<MasterInfo>, ClusterError> {
        let Some(raw) = self.inner.repo.get(&self.inner.key)? else {
            return Ok(None);
        };
        let info = serde_json::from_slice(&raw)
            .map_err(|err| ClusterError::Election(format!("decode master info: {err}")))?;
        Ok(Some(info))
    }

    /// Stop campaigning; a held lease is resigned so the next node takes
    /// over immediately.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self.join_handle.lock().take() {
            let _ = handle.join();
        }
        if self.inner.is_master.swap(false, Ordering::AcqRel) {
            let node_id = self.inner.node.id();
            if let Err(err) = self.inner.repo.resign(&self.inner.key, &node_id) {
                tracing::warn!(node = %node_id, error = %err, "resign on close failed");
            }
            self.inner.listener.on_resignation();
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::repo::MemoryRepository;

    const TTL: Duration = Duration::from_millis(150);

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<&'static str>>,
        fail_overs_to_fail: Mutex<u32>,
    }

    impl RecordingListener {
        fn events(&self) -> Vec<&'static str> {
            self.events.lock().clone()
        }
    }

    impl ElectionListener for RecordingListener {
        fn on_fail_over(&self) -> Result<(), ClusterError> {
            let mut to_fail = self.fail_overs_to_fail.lock();
            if *to_fail > 0 {
                *to_fail -= 1;
                self.events.lock().push("fail_over_err");
                return Err(ClusterError::StateMachine("boom".to_string()));
            }
            self.events.lock().push("fail_over");
            Ok(())
        }

        fn on_resignation(&self) {
            self.events.lock().push("resignation");
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn election(
        repo: &Arc<MemoryRepository>,
        port: u16,
        listener: &Arc<RecordingListener>,
    ) -> Election {
        Election::new(
            repo.clone() as Arc<dyn Repository>,
            Node::new("host", port),
            "/master/node",
            TTL,
            listener.clone() as Arc<dyn ElectionListener>,
        )
    }

    #[test]
    fn test_single_node_becomes_master() {
        let repo = Arc::new(MemoryRepository::new());
        let listener = Arc::new(RecordingListener::default());
        let elect = election(&repo, 1, &listener);
        assert!(!elect.is_master());
        assert!(elect.get_master().unwrap().is_none());

        elect.initialize();
        elect.elect().unwrap();
        wait_until(|| elect.is_master());

        let master = elect.get_master().unwrap().unwrap();
        assert_eq!(master.node, Node::new("host", 1));
        assert_eq!(listener.events(), vec!["fail_over"]);
        elect.close();
    }

    #[test]
    fn test_failover_moves_to_second_node() {
        let repo = Arc::new(MemoryRepository::new());
        let listener1 = Arc::new(RecordingListener::default());
        let listener2 = Arc::new(RecordingListener::default());
        let elect1 = election(&repo, 1, &listener1);
        let elect2 = election(&repo, 2, &listener2);

        elect1.elect().unwrap();
        wait_until(|| elect1.is_master());

        elect2.elect().unwrap();
        std::thread::sleep(TTL);
        assert!(!elect2.is_master());

        // closing the master resigns the lease; the standby takes over
        elect1.close();
        assert_eq!(listener1.events(), vec!["fail_over", "resignation"]);
        wait_until(|| elect2.is_master());
        assert_eq!(
            elect2.get_master().unwrap().unwrap().node,
            Node::new("host", 2)
        );
        elect2.close();
    }

    #[test]
    fn test_renewal_failure_resigns_then_reelects() {
        let repo = Arc::new(MemoryRepository::new());
        let listener = Arc::new(RecordingListener::default());
        let elect = election(&repo, 1, &listener);
        elect.elect().unwrap();
        wait_until(|| elect.is_master());

        // the coordinator times the lease out under us
        repo.expire_lease("/master/node");
        wait_until(|| listener.events().contains(&"resignation"));

        // the campaign keeps running and wins the key back
        wait_until(|| elect.is_master());
        assert_eq!(
            listener.events(),
            vec!["fail_over", "resignation", "fail_over"]
        );
        elect.close();
    }

    #[test]
    fn test_failed_fail_over_abandons_leadership_and_retries() {
        let repo = Arc::new(MemoryRepository::new());
        let listener = Arc::new(RecordingListener::default());
        *listener.fail_overs_to_fail.lock() = 1;
        let elect = election(&repo, 1, &listener);
        elect.elect().unwrap();

        wait_until(|| elect.is_master());
        assert_eq!(listener.events(), vec!["fail_over_err", "fail_over"]);
        elect.close();
    }
}
