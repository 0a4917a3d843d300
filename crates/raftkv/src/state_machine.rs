//! The replicated key-value state machine.
//!
//! [`KvStateMachine`] implements the three callbacks the consensus module
//! drives: `apply` for committed entries, `snapshot` for log compaction and
//! `restore` for installing a snapshot. The openraft storage glue in
//! [`crate::log_storage`] only translates between openraft types and these
//! calls.
//!
//! A payload that fails to decode, or a snapshot that fails to restore, puts
//! the machine in a terminal halted state. Every replica receives the same
//! committed bytes, so continuing past either failure would silently diverge
//! from the rest of the cluster.

use crate::command::{self, Command, CommandResponse, DecodeError, Operation};
use crate::snapshot::{self, RestoreError, Snapshot, SnapshotError};
use crate::store::StateStore;
use crate::type_config::{LogId, StoredMembership};
use parking_lot::Mutex;
use std::sync::OnceLock;
use thiserror::Error;

/// Whether this node can still serve traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Health {
    Serving,
    /// Terminal. An external supervisor must restart the node.
    Halted { reason: String },
}

impl Health {
    pub fn is_serving(&self) -> bool {
        matches!(self, Health::Serving)
    }
}

/// Conditions after which this node must stop applying entries.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("state machine is halted: {0}")]
    Halted(String),

    #[error("committed entry {log_id} could not be decoded: {source}")]
    Decode {
        log_id: LogId,
        #[source]
        source: DecodeError,
    },

    #[error(transparent)]
    Restore(#[from] RestoreError),
}

/// Log position and membership covered by the applied state.
#[derive(Clone, Debug, Default)]
pub struct AppliedState {
    pub last_applied_log: Option<LogId>,
    pub last_membership: StoredMembership,
}

/// A captured snapshot together with the log position it reflects.
#[derive(Debug)]
pub struct CapturedSnapshot {
    pub snapshot: Snapshot,
    pub applied: AppliedState,
}

/// Key-value state machine fed by the Raft log.
#[derive(Debug, Default)]
pub struct KvStateMachine {
    store: StateStore,
    /// Held while mutating `store` and while capturing it, so a captured
    /// map always matches its `last_applied_log`. Lock order: applied, then
    /// the store lock.
    applied: Mutex<AppliedState>,
    halted: OnceLock<String>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local store, used for leader reads.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn health(&self) -> Health {
        match self.halted.get() {
            Some(reason) => Health::Halted {
                reason: reason.clone(),
            },
            None => Health::Serving,
        }
    }

    /// Enter the halted state. The first reason wins.
    pub fn halt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.halted.set(reason.clone()).is_ok() {
            tracing::error!(%reason, "state machine halted");
        }
    }

    fn ensure_serving(&self) -> Result<(), FatalError> {
        match self.halted.get() {
            Some(reason) => Err(FatalError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    pub fn applied_state(&self) -> AppliedState {
        self.applied.lock().clone()
    }

    /// Apply one committed command payload.
    pub fn apply(&self, log_id: LogId, payload: &[u8]) -> Result<CommandResponse, FatalError> {
        self.ensure_serving()?;

        let cmd = match command::decode(payload) {
            Ok(cmd) => cmd,
            Err(source) => {
                let err = FatalError::Decode { log_id, source };
                self.halt(err.to_string());
                return Err(err);
            }
        };

        let mut applied = self.applied.lock();
        let response = self.mutate(cmd);
        applied.last_applied_log = Some(log_id);

        tracing::debug!(%log_id, ?response, "applied command");
        Ok(response)
    }

    fn mutate(&self, cmd: Command) -> CommandResponse {
        match cmd.operation {
            Operation::Put => {
                let replaced = self.store.set(cmd.key, cmd.value).is_some();
                CommandResponse::Put { replaced }
            }
            Operation::Delete => {
                let existed = self.store.delete(&cmd.key).is_some();
                CommandResponse::Delete { existed }
            }
        }
    }

    /// Record an entry that carries no command.
    pub fn apply_blank(&self, log_id: LogId) -> Result<CommandResponse, FatalError> {
        self.ensure_serving()?;
        self.applied.lock().last_applied_log = Some(log_id);
        Ok(CommandResponse::Noop)
    }

    /// Record a committed membership change.
    pub fn apply_membership(
        &self,
        membership: StoredMembership,
    ) -> Result<CommandResponse, FatalError> {
        self.ensure_serving()?;
        let mut applied = self.applied.lock();
        applied.last_applied_log = *membership.log_id();
        applied.last_membership = membership;
        Ok(CommandResponse::Noop)
    }

    /// Capture the current state.
    pub fn snapshot(&self) -> Result<CapturedSnapshot, SnapshotError> {
        let applied = self.applied.lock();
        let snapshot = snapshot::capture(&self.store)?;
        Ok(CapturedSnapshot {
            snapshot,
            applied: applied.clone(),
        })
    }

    /// Replace the state with a snapshot.
    ///
    /// The consensus module never calls this concurrently with `apply`; the
    /// store lock still guards concurrent leader reads.
    pub fn restore(&self, bytes: &[u8], applied: AppliedState) -> Result<(), FatalError> {
        self.ensure_serving()?;

        let data = match snapshot::restore(bytes) {
            Ok(data) => data,
            Err(e) => {
                self.halt(e.to_string());
                return Err(e.into());
            }
        };

        let mut current = self.applied.lock();
        tracing::info!(
            keys = data.len(),
            last_applied = ?applied.last_applied_log,
            "restoring state machine from snapshot"
        );
        self.store.replace(data);
        *current = applied;
        Ok(())
    }
}
