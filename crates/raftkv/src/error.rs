//! Error types for key-value and membership operations.

use crate::command::{DecodeError, EncodeError};
use crate::snapshot::RestoreError;
use thiserror::Error;

/// Result type for key-value operations.
pub type KvResult<T> = std::result::Result<T, KvError>;

/// Errors surfaced by [`crate::KvStore`] operations.
#[derive(Debug, Error)]
pub enum KvError {
    /// This node is not the leader. Retry against `hint` (empty if unknown).
    #[error("not the leader, leader is at {hint:?}")]
    NotLeader { hint: String },

    /// The command did not commit within the timeout or was rejected.
    /// The outcome is unknown; retrying the same command is safe.
    #[error("command was not applied: {0}")]
    Apply(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// `node_id` is already a member with a different address.
    #[error("node {node_id} is already a member at {existing}, not {requested}")]
    Conflict {
        node_id: String,
        existing: String,
        requested: String,
    },

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The state machine hit a fatal condition and stopped applying entries.
    #[error("node halted: {0}")]
    Halted(String),

    /// The consensus module failed in a way unrelated to a single command.
    #[error("consensus error: {0}")]
    Consensus(String),
}

impl KvError {
    pub fn not_leader(hint: impl Into<String>) -> Self {
        KvError::NotLeader { hint: hint.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_message_includes_hint() {
        let err = KvError::not_leader("10.0.0.2:7000");
        assert!(err.to_string().contains("10.0.0.2:7000"));
    }

    #[test]
    fn conflict_message_names_both_addresses() {
        let err = KvError::Conflict {
            node_id: "n2".into(),
            existing: "a:1".into(),
            requested: "b:2".into(),
        };
        assert_eq!(
            err.to_string(),
            "node n2 is already a member at a:1, not b:2"
        );
    }
}
