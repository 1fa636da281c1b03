//! Coordinator repository surface: TTL-scoped leases at well-known paths.
//!
//! The election only needs four operations from the distributed store:
//! acquire a lease (first writer wins, expired leases can be taken over),
//! renew an owned lease, read a key, and resign. Real deployments back
//! this with their coordinator store; [`MemoryRepository`] backs tests
//! and single-process mode.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use gale_common::error::RepoError;

/// TTL-lease store consumed by the election.
pub trait Repository: Send + Sync {
    /// Attempt to take the lease at `key` for `owner`, valid for `ttl`.
    /// Returns false when someone else holds a live lease. Re-acquiring
    /// an owned lease renews it.
    fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, RepoError>;

    /// Renew the lease at `key`; fails with [`RepoError::NotOwner`] when
    /// the lease expired or belongs to someone else.
    fn keep_alive(&self, key: &str, owner: &str) -> Result<(), RepoError>;

    /// Value stored under a live lease at `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RepoError>;

    /// Drop the lease at `key` if `owner` holds it.
    fn resign(&self, key: &str, owner: &str) -> Result<(), RepoError>;
}

struct Lease {
    owner: String,
    value: Vec<u8>,
    ttl: Duration,
    expires_at: Instant,
}

impl Lease {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory [`Repository`] with deadline-based lease expiry.
#[derive(Default)]
pub struct MemoryRepository {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the lease at `key` to expire, as if the coordinator timed it
    /// out. The next renewal by its owner fails.
    pub fn expire_lease(&self, key: &str) {
        if let Some(lease) = self.leases.lock().get_mut(key) {
            lease.expires_at = Instant::now();
        }
    }
}

impl Repository for MemoryRepository {
    fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, RepoError> {
        let mut leases = self.leases.lock();
        if let Some(lease) = leases.get(key) {
            if !lease.is_expired() && lease.owner != owner {
                return Ok(false);
            }
        }
        leases.insert(
            key.to_string(),
            Lease {
                owner: owner.to_string(),
                value,
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    fn keep_alive(&self, key: &str, owner: &str) -> Result<(), RepoError> {
        let mut leases = self.leases.lock();
        match leases.get_mut(key) {
            Some(lease) if !lease.is_expired() && lease.owner == owner => {
                lease.expires_at = Instant::now() + lease.ttl;
                Ok(())
            }
            _ => Err(RepoError::NotOwner),
        }
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RepoError> {
        let leases = self.leases.lock();
        Ok(leases
            .get(key)
            .filter(|lease| !lease.is_expired())
            .map(|lease| lease.value.clone()))
    }

    fn resign(&self, key: &str, owner: &str) -> Result<(), RepoError> {
        let mut leases = self.leases.lock();
        if let Some(lease) = leases.get(key) {
            if lease.owner == owner {
                leases.remove(key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(50);

    #[test]
    fn test_acquire_is_exclusive() {
        let repo = MemoryRepository::new();
        assert!(repo.try_acquire("/master", "a", b"a".to_vec(), TTL).unwrap());
        assert!(!repo.try_acquire("/master", "b", b"b".to_vec(), TTL).unwrap());
        // the owner can re-acquire (renew)
        assert!(repo.try_acquire("/master", "a", b"a2".to_vec(), TTL).unwrap());
        assert_eq!(repo.get("/master").unwrap(), Some(b"a2".to_vec()));
    }

    #[test]
    fn test_expired_lease_can_be_taken() {
        let repo = MemoryRepository::new();
        assert!(repo.try_acquire("/master", "a", b"a".to_vec(), TTL).unwrap());
        repo.expire_lease("/master");
        assert_eq!(repo.get("/master").unwrap(), None);
        assert!(repo.try_acquire("/master", "b", b"b".to_vec(), TTL).unwrap());
        assert_eq!(repo.get("/master").unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn test_keep_alive_extends_only_for_owner() {
        let repo = MemoryRepository::new();
        repo.try_acquire("/master", "a", b"a".to_vec(), TTL).unwrap();
        repo.keep_alive("/master", "a").unwrap();
        assert!(matches!(
            repo.keep_alive("/master", "b"),
            Err(RepoError::NotOwner)
        ));

        repo.expire_lease("/master");
        assert!(matches!(
            repo.keep_alive("/master", "a"),
            Err(RepoError::NotOwner)
        ));
    }

    #[test]
    fn test_resign_removes_own_lease_only() {
        let repo = MemoryRepository::new();
        repo.try_acquire("/master", "a", b"a".to_vec(), TTL).unwrap();
        repo.resign("/master", "b").unwrap();
        assert!(repo.get("/master").unwrap().is_some());
        repo.resign("/master", "a").unwrap();
        assert!(repo.get("/master").unwrap().is_none());
    }
}
