//! Cluster membership changes.
//!
//! Members are identified by name. Moving a member to a new address is an
//! explicit `remove` followed by `join`; `join` never overwrites an address.

use crate::consensus::{Consensus, Member, SubmitError};
use crate::error::{KvError, KvResult};
use crate::raft_id;
use std::sync::Arc;

/// Adds and removes voters through the replicated log.
#[derive(Clone)]
pub struct MembershipManager {
    consensus: Arc<dyn Consensus>,
}

impl MembershipManager {
    pub fn new(consensus: Arc<dyn Consensus>) -> Self {
        Self { consensus }
    }

    fn ensure_leader(&self) -> KvResult<()> {
        let leadership = self.consensus.leadership();
        if leadership.is_leader {
            Ok(())
        } else {
            Err(KvError::not_leader(leadership.leader_hint))
        }
    }

    /// Add `node_id` at `addr` as a voter.
    ///
    /// Re-joining with the same address succeeds without a configuration
    /// change. A different address, or a different name that maps to the same
    /// numeric id, is a [`KvError::Conflict`].
    ///
    /// The check above runs before the configuration change is proposed, so
    /// two joins for the same name can race. The consensus engine keeps the
    /// first recorded address; the loser sees it on re-read and gets a
    /// conflict instead of a silent success.
    pub async fn join(&self, node_id: &str, addr: &str) -> KvResult<()> {
        if node_id.is_empty() {
            return Err(KvError::InvalidArgument("node id must not be empty".into()));
        }
        if addr.is_empty() {
            return Err(KvError::InvalidArgument("address must not be empty".into()));
        }
        self.ensure_leader()?;

        let id = raft_id(node_id);
        for member in self.consensus.members() {
            if member.name == node_id {
                if member.addr != addr {
                    return Err(KvError::Conflict {
                        node_id: node_id.to_string(),
                        existing: member.addr,
                        requested: addr.to_string(),
                    });
                }
                if member.voter {
                    tracing::debug!(node = %node_id, %addr, "already a member");
                    return Ok(());
                }
            } else if member.raft_id() == id {
                return Err(KvError::Conflict {
                    node_id: node_id.to_string(),
                    existing: format!("{} ({})", member.addr, member.name),
                    requested: addr.to_string(),
                });
            }
        }

        tracing::info!(node = %node_id, %addr, "joining node");
        self.consensus
            .add_voter(Member::voter(node_id, addr))
            .await
            .map_err(submit_error)?;

        match self.consensus.members().into_iter().find(|m| m.name == node_id) {
            Some(member) if member.addr != addr => {
                tracing::warn!(
                    node = %node_id,
                    existing = %member.addr,
                    requested = %addr,
                    "lost join race"
                );
                Err(KvError::Conflict {
                    node_id: node_id.to_string(),
                    existing: member.addr,
                    requested: addr.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Remove voter `node_id`. Unknown ids are a no-op.
    pub async fn remove(&self, node_id: &str) -> KvResult<()> {
        if node_id.is_empty() {
            return Err(KvError::InvalidArgument("node id must not be empty".into()));
        }
        self.ensure_leader()?;

        let members = self.consensus.members();
        let Some(target) = members.iter().find(|m| m.name == node_id) else {
            return Ok(());
        };
        let voters = members.iter().filter(|m| m.voter).count();
        if target.voter && voters <= 1 {
            return Err(KvError::InvalidArgument(format!(
                "cannot remove {}, the last voter",
                node_id
            )));
        }

        tracing::info!(node = %node_id, "removing node");
        self.consensus
            .remove_voter(node_id)
            .await
            .map_err(submit_error)
    }
}

fn submit_error(err: SubmitError) -> KvError {
    match err {
        SubmitError::NotLeader { hint } => KvError::NotLeader { hint },
        SubmitError::Fatal(reason) => KvError::Consensus(reason),
        other => KvError::Apply(other.to_string()),
    }
}
