//! OpenRaft type configuration for the key-value store.
//!
//! This module defines the `TypeConfig` that configures all the generic types
//! used throughout the Raft implementation.

use crate::{CommandResponse, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;

/// Opaque replicated payload: the bytes produced by the command codec.
///
/// The log never carries a typed command. Decoding happens in the state
/// machine, on every replica, from these exact bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope(pub Vec<u8>);

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "envelope({} bytes)", self.0.len())
    }
}

/// A cluster member as recorded in the Raft membership config.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNode {
    /// Operator-chosen node name (the external node id).
    pub name: String,
    /// Raft RPC address, e.g. "127.0.0.1:12000".
    pub addr: String,
}

impl PeerNode {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
        }
    }
}

impl fmt::Display for PeerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

// Declare raft types using the macro for openraft 0.9 compatibility
openraft::declare_raft_types!(
    /// Raft type configuration for raftkv.
    pub TypeConfig:
        D = Envelope,
        R = CommandResponse,
        NodeId = NodeId,
        Node = PeerNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
);

/// Type alias for log entries.
pub type Entry = openraft::Entry<TypeConfig>;

/// Type alias for log ID.
pub type LogId = openraft::LogId<NodeId>;

/// Type alias for vote.
pub type Vote = openraft::Vote<NodeId>;

/// Type alias for snapshot metadata.
pub type SnapshotMeta = openraft::SnapshotMeta<NodeId, PeerNode>;

/// Type alias for stored membership.
pub type StoredMembership = openraft::StoredMembership<NodeId, PeerNode>;

/// Type alias for storage errors.
pub type StorageError = openraft::StorageError<NodeId>;

/// Type alias for client write errors surfaced by `Raft::client_write`.
pub type ClientWriteError =
    openraft::error::RaftError<NodeId, openraft::error::ClientWriteError<NodeId, PeerNode>>;
