//! Configuration sections for the storage engine and the coordinator.
//!
//! Durations are carried as integer millisecond fields so the sections
//! round-trip through any serde format without custom adapters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time-series storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsdbConfig {
    /// Age after which a non-empty mutable memory database is flushed,
    /// regardless of size. Default: 30 minutes.
    #[serde(default = "default_mutable_memdb_ttl_ms")]
    pub mutable_memdb_ttl_ms: u64,
    /// Heap budget per memory database before a flush is forced.
    /// Default: 512 MiB.
    #[serde(default = "default_max_memdb_size_bytes")]
    pub max_memdb_size_bytes: u64,
    /// Interval between flush-checker sweeps over the family manager.
    /// Default: 10 seconds.
    #[serde(default = "default_flush_check_interval_ms")]
    pub flush_check_interval_ms: u64,
}

fn default_mutable_memdb_ttl_ms() -> u64 {
    30 * 60 * 1000
}

fn default_max_memdb_size_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_flush_check_interval_ms() -> u64 {
    10_000
}

impl Default for TsdbConfig {
    fn default() -> Self {
        Self {
            mutable_memdb_ttl_ms: default_mutable_memdb_ttl_ms(),
            max_memdb_size_bytes: default_max_memdb_size_bytes(),
            flush_check_interval_ms: default_flush_check_interval_ms(),
        }
    }
}

impl TsdbConfig {
    pub fn mutable_memdb_ttl(&self) -> Duration {
        Duration::from_millis(self.mutable_memdb_ttl_ms)
    }

    pub fn flush_check_interval(&self) -> Duration {
        Duration::from_millis(self.flush_check_interval_ms)
    }
}

/// Cluster coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Master lease TTL. The lease is renewed at roughly a third of this.
    /// Default: 10 seconds.
    #[serde(default = "default_elect_ttl_ms")]
    pub elect_ttl_ms: u64,
    /// Well-known repository path the master lease is keyed by.
    #[serde(default = "default_master_path")]
    pub master_path: String,
}

fn default_elect_ttl_ms() -> u64 {
    10_000
}

fn default_master_path() -> String {
    "/master/node".to_string()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            elect_ttl_ms: default_elect_ttl_ms(),
            master_path: default_master_path(),
        }
    }
}

impl CoordinatorConfig {
    pub fn elect_ttl(&self) -> Duration {
        Duration::from_millis(self.elect_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tsdb_defaults() {
        let cfg = TsdbConfig::default();
        assert_eq!(cfg.mutable_memdb_ttl(), Duration::from_secs(1800));
        assert_eq!(cfg.max_memdb_size_bytes, 512 * 1024 * 1024);
        assert_eq!(cfg.flush_check_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_coordinator_defaults() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.elect_ttl(), Duration::from_secs(10));
        assert_eq!(cfg.master_path, "/master/node");
    }
}
