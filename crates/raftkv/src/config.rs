//! Raft node configuration.

use crate::kv::DEFAULT_APPLY_TIMEOUT;
use crate::{raft_id, NodeId};
use openraft::SnapshotPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A configuration value that cannot produce a working node.
#[derive(Debug, Error)]
#[error("invalid node config: {0}")]
pub struct ConfigError(String);

/// Configuration for a node in the cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node name. The numeric Raft id is derived from it.
    pub name: String,

    /// Address the Raft RPC server listens on (e.g., "127.0.0.1:12000").
    /// Port 0 picks a free port; the bound address is advertised instead.
    pub raft_addr: String,

    /// Directory for snapshot files.
    pub data_dir: PathBuf,

    /// Election timeout range in milliseconds.
    /// A random value within this range is used for each election.
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,

    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Build a snapshot after this many entries since the last one.
    pub snapshot_threshold: u64,

    /// How long a client write waits to commit.
    pub apply_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node1".to_string(),
            raft_addr: "127.0.0.1:12000".to_string(),
            data_dir: PathBuf::from("./raft_data"),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            snapshot_threshold: 1024,
            apply_timeout_ms: DEFAULT_APPLY_TIMEOUT.as_millis() as u64,
        }
    }
}

impl NodeConfig {
    /// Create a new node configuration.
    pub fn new(name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Numeric id of this node inside openraft.
    pub fn node_id(&self) -> NodeId {
        raft_id(&self.name)
    }

    /// Set the Raft listen address.
    pub fn with_raft_addr(mut self, addr: impl Into<String>) -> Self {
        self.raft_addr = addr.into();
        self
    }

    /// Set election timeout range.
    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    /// Set heartbeat interval.
    pub fn with_heartbeat_interval(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn with_snapshot_threshold(mut self, entries: u64) -> Self {
        self.snapshot_threshold = entries;
        self
    }

    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    /// Path to the snapshot directory.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError("node name must not be empty".into()));
        }
        if self.raft_addr.is_empty() {
            return Err(ConfigError("raft address must not be empty".into()));
        }
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(ConfigError(format!(
                "election timeout min {}ms must be below max {}ms",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(ConfigError(format!(
                "heartbeat {}ms must be below election timeout {}ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.snapshot_threshold == 0 {
            return Err(ConfigError("snapshot threshold must be positive".into()));
        }
        if self.apply_timeout_ms == 0 {
            return Err(ConfigError("apply timeout must be positive".into()));
        }
        Ok(())
    }

    /// Build OpenRaft config from this node config.
    pub fn to_openraft_config(&self) -> openraft::Config {
        openraft::Config {
            cluster_name: "raftkv".to_string(),
            election_timeout_min: self.election_timeout_min_ms,
            election_timeout_max: self.election_timeout_max_ms,
            heartbeat_interval: self.heartbeat_interval_ms,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            ..Default::default()
        }
    }
}
