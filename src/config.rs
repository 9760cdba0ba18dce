// Server configuration
//
// Defaults mirror the constants the cache was tuned with; a JSON file can
// override any of them. Per-shard budgets are derived here once so the rest
// of the code never divides by the shard count.

use crate::error::{CacheError, Result};
use serde::Deserialize;
use std::path::Path;

/// Maximum key length on the wire (one length byte).
pub const KEY_SIZE_MAX: usize = 255;

/// Cache server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of shard worker threads.
    pub shards: u32,
    /// Aggregate connection limit, split evenly across shards.
    pub max_conn: u32,
    /// Total value memory budget in bytes, split evenly across shards.
    pub mem_limit: u64,
    /// TCP read/write timeout in milliseconds; also the per-key lock expiry
    /// tick period.
    pub tcp_timeout_ms: u32,
    /// Data-plane listen port.
    pub port: u16,
    /// Run the Raft membership plane.
    pub cluster: bool,
    /// Raft peer port; the admin channel listens on `raft_port + 1`.
    pub raft_port: u16,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            max_conn: 512,
            mem_limit: 100 << 20,
            tcp_timeout_ms: 3000,
            port: 11311,
            cluster: false,
            raft_port: 11312,
        }
    }
}

impl CacheConfig {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: CacheConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 {
            return Err(CacheError::Configuration(
                "shards must be at least 1".to_string(),
            ));
        }
        if self.max_conn == 0 || self.max_conn < self.shards {
            return Err(CacheError::Configuration(format!(
                "max_conn {} cannot cover {} shards",
                self.max_conn, self.shards
            )));
        }
        if self.mem_limit == 0 || self.mem_limit / u64::from(self.shards) < (1 << 20) {
            return Err(CacheError::Configuration(
                "mem_limit must leave at least 1 MiB per shard".to_string(),
            ));
        }
        if self.tcp_timeout_ms == 0 {
            return Err(CacheError::Configuration(
                "tcp_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Connection budget of one shard.
    pub fn conn_per_shard(&self) -> usize {
        (self.max_conn / self.shards) as usize
    }

    /// Page budget of one shard.
    pub fn pages_per_shard(&self) -> u64 {
        (self.mem_limit / u64::from(self.shards)) >> crate::memory::PAGE_SHIFT
    }
}
