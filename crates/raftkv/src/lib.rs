//! A replicated key-value store on top of OpenRaft.
//!
//! Every node keeps the whole key space in memory. Writes are encoded into
//! commands, replicated through the Raft log and applied on each node in
//! commit order, so all nodes converge to the same map.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            KvNode                                │
//! │  ┌──────────────┐    ┌────────────────────┐    ┌──────────────┐  │
//! │  │   RaftKv     │───▶│ OpenRaftConsensus  │───▶│  RaftNode    │  │
//! │  │  (KvStore)   │    │   (Consensus)      │    │  (openraft)  │  │
//! │  └──────────────┘    └────────────────────┘    └──────────────┘  │
//! │         │                                             │          │
//! │         │ leader reads                     committed  │          │
//! │         ▼                                  entries    ▼          │
//! │  ┌──────────────┐    ┌────────────────────┐    ┌──────────────┐  │
//! │  │  StateStore  │◀───│  KvStateMachine    │◀───│ MemRaftStore │  │
//! │  └──────────────┘    └────────────────────┘    └──────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//!                                   │ HTTP (reqwest / axum)
//!                       ┌───────────┴───────────┐
//!                       ▼                       ▼
//!               ┌──────────────┐        ┌──────────────┐
//!               │    Node 2    │        │    Node 3    │
//!               └──────────────┘        └──────────────┘
//! ```
//!
//! # Single-Node Cluster
//!
//! ```rust,ignore
//! use raftkv::{KvNode, KvStore, NodeConfig};
//!
//! let node = KvNode::start(NodeConfig::new("node1", "./node1")).await?;
//! node.bootstrap().await?;
//! node.wait_for_leader(Duration::from_secs(5)).await?;
//!
//! let kv = node.kv();
//! kv.put([("a".to_string(), "1".to_string())].into()).await?;
//! assert_eq!(kv.get("a").await?, Some("1".to_string()));
//! ```
//!
//! A second node joins by asking the leader's `KvStore::join` to add it.
//!
//! # HTTP Endpoints
//!
//! Each node exposes the following Raft RPC endpoints:
//! - `POST /raft/append_entries` - Log replication from leader
//! - `POST /raft/vote` - Leader election votes
//! - `POST /raft/install_snapshot` - State transfer for new nodes
//! - `GET /health` - Node health and Raft status
//!
//! # Modules
//!
//! - [`command`]: Replicated command format and codec
//! - [`store`]: In-memory key-value map
//! - [`snapshot`]: Snapshot capture, persistence and restore
//! - [`state_machine`]: Applies committed commands
//! - [`log_storage`]: In-memory Raft log bound to the state machine
//! - [`consensus`]: Boundary between the KV core and openraft
//! - [`kv`]: Client-facing key-value operations
//! - [`membership`]: Joining and removing nodes
//! - [`network`]: HTTP transport for inter-node communication
//! - [`http_server`]: Axum HTTP endpoints for Raft RPCs
//! - [`node`]: Wiring everything into a running node
//! - [`config`]: Node configuration
//! - [`type_config`]: OpenRaft type configuration

pub mod command;
pub mod config;
pub mod consensus;
pub mod error;
pub mod http_server;
pub mod kv;
pub mod log_storage;
pub mod membership;
pub mod network;
pub mod node;
pub mod snapshot;
pub mod state_machine;
pub mod store;
pub mod type_config;

pub use command::{Command, CommandResponse, DecodeError, EncodeError, Operation};
pub use config::{ConfigError, NodeConfig};
pub use consensus::{Consensus, Leadership, Member, OpenRaftConsensus, SubmitError};
pub use error::{KvError, KvResult};
pub use http_server::{create_router, start_server, RaftHttpState, ServerHandle};
pub use kv::{KvStore, MemoryKv, RaftKv, DEFAULT_APPLY_TIMEOUT};
pub use log_storage::{new_log_store, LogStore, MemRaftStore};
pub use membership::MembershipManager;
pub use network::{HttpNetwork, HttpNetworkFactory};
pub use node::{KvNode, NodeError};
pub use snapshot::{
    FileSnapshotSink, MemorySnapshotSink, RestoreError, Snapshot, SnapshotError, SnapshotSink,
};
pub use state_machine::{Health, KvStateMachine};
pub use store::StateStore;
pub use type_config::{PeerNode, TypeConfig};

use openraft::Raft;

/// The Raft consensus node type for this store.
pub type RaftNode = Raft<TypeConfig>;

/// Node identifier type.
pub type NodeId = u64;

/// Numeric Raft id for a node name.
///
/// Distinct names can collide; membership changes reject a name whose id
/// is already taken by another member.
pub fn raft_id(name: &str) -> NodeId {
    crc32fast::hash(name.as_bytes()) as NodeId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raft_id_is_stable() {
        assert_eq!(raft_id("node1"), raft_id("node1"));
        assert_ne!(raft_id("node1"), raft_id("node2"));
        assert_eq!(raft_id(""), 0);
    }
}
