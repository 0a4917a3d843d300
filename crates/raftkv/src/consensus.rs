//! The boundary between the key-value core and the consensus engine.
//!
//! [`RaftKv`](crate::RaftKv) and [`MembershipManager`](crate::MembershipManager)
//! only talk to openraft through the [`Consensus`] trait, so tests can drive
//! them with doubles that never elect a leader or never commit.

use crate::command::CommandResponse;
use crate::type_config::{ClientWriteError, Envelope, PeerNode};
use crate::{raft_id, NodeId, RaftNode};
use async_trait::async_trait;
use openraft::error::{InitializeError, RaftError};
use openraft::ServerState;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Who leads the cluster, as seen from this node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Leadership {
    pub is_leader: bool,
    /// Raft RPC address of the current leader, empty when unknown.
    ///
    /// This is the address peers replicate to, not the leader's client API
    /// address; nodes only learn each other's Raft addresses.
    pub leader_hint: String,
}

impl Leadership {
    pub fn leader() -> Self {
        Self {
            is_leader: true,
            leader_hint: String::new(),
        }
    }

    pub fn follower(hint: impl Into<String>) -> Self {
        Self {
            is_leader: false,
            leader_hint: hint.into(),
        }
    }
}

/// A node in the cluster configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub addr: String,
    /// False for learners that receive the log but do not vote.
    pub voter: bool,
}

impl Member {
    pub fn voter(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            voter: true,
        }
    }

    /// Numeric id used inside the consensus engine.
    pub fn raft_id(&self) -> NodeId {
        raft_id(&self.name)
    }

    fn peer_node(&self) -> PeerNode {
        PeerNode::new(self.name.clone(), self.addr.clone())
    }
}

/// Why a replicated operation did not complete.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("not the leader, leader is at {hint:?}")]
    NotLeader { hint: String },

    /// The entry may still commit later.
    #[error("not committed within {0:?}")]
    Timeout(Duration),

    #[error("rejected by consensus: {0}")]
    Rejected(String),

    /// The consensus engine stopped and will not accept further entries.
    #[error("consensus stopped: {0}")]
    Fatal(String),
}

/// Replicated log operations used by the key-value core.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Replicate `payload` and wait until it has been applied locally.
    async fn submit(
        &self,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<CommandResponse, SubmitError>;

    fn leadership(&self) -> Leadership;

    /// Current cluster configuration, voters and learners.
    fn members(&self) -> Vec<Member>;

    /// Add `member` to the configuration as a voter.
    ///
    /// A node already present keeps the address it was recorded with.
    async fn add_voter(&self, member: Member) -> Result<(), SubmitError>;

    /// Drop the voter named `name` from the configuration.
    async fn remove_voter(&self, name: &str) -> Result<(), SubmitError>;

    /// Form a new single-node cluster containing only `member`.
    async fn bootstrap(&self, member: Member) -> Result<(), SubmitError>;
}

/// [`Consensus`] backed by an openraft node.
#[derive(Clone)]
pub struct OpenRaftConsensus {
    raft: Arc<RaftNode>,
}

impl OpenRaftConsensus {
    pub fn new(raft: Arc<RaftNode>) -> Self {
        Self { raft }
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    fn voter_ids(&self) -> BTreeSet<NodeId> {
        let metrics = self.raft.metrics().borrow().clone();
        metrics.membership_config.membership().voter_ids().collect()
    }
}

fn write_error(err: ClientWriteError) -> SubmitError {
    match err {
        RaftError::APIError(openraft::error::ClientWriteError::ForwardToLeader(fwd)) => {
            SubmitError::NotLeader {
                hint: fwd.leader_node.map(|n| n.addr).unwrap_or_default(),
            }
        }
        RaftError::APIError(e) => SubmitError::Rejected(e.to_string()),
        RaftError::Fatal(f) => SubmitError::Fatal(f.to_string()),
    }
}

#[async_trait]
impl Consensus for OpenRaftConsensus {
    async fn submit(
        &self,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<CommandResponse, SubmitError> {
        let write = self.raft.client_write(Envelope(payload));
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(resp)) => Ok(resp.data),
            Ok(Err(e)) => Err(write_error(e)),
            Err(_) => Err(SubmitError::Timeout(timeout)),
        }
    }

    fn leadership(&self) -> Leadership {
        let metrics = self.raft.metrics().borrow().clone();
        if metrics.state == ServerState::Leader && metrics.current_leader == Some(metrics.id) {
            return Leadership::leader();
        }

        let hint = metrics
            .current_leader
            .and_then(|id| {
                metrics
                    .membership_config
                    .membership()
                    .get_node(&id)
                    .map(|n| n.addr.clone())
            })
            .unwrap_or_default();
        Leadership::follower(hint)
    }

    fn members(&self) -> Vec<Member> {
        let metrics = self.raft.metrics().borrow().clone();
        let membership = metrics.membership_config.membership();
        let voters: BTreeSet<NodeId> = membership.voter_ids().collect();
        membership
            .nodes()
            .map(|(id, node)| Member {
                name: node.name.clone(),
                addr: node.addr.clone(),
                voter: voters.contains(id),
            })
            .collect()
    }

    async fn add_voter(&self, member: Member) -> Result<(), SubmitError> {
        let id = member.raft_id();
        self.raft
            .add_learner(id, member.peer_node(), true)
            .await
            .map_err(write_error)?;

        let mut voters = self.voter_ids();
        if voters.insert(id) {
            self.raft
                .change_membership(voters, false)
                .await
                .map_err(write_error)?;
        }
        tracing::info!(node = %member.name, addr = %member.addr, id, "voter added");
        Ok(())
    }

    async fn remove_voter(&self, name: &str) -> Result<(), SubmitError> {
        let id = raft_id(name);
        let mut voters = self.voter_ids();
        if !voters.remove(&id) {
            return Ok(());
        }
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(write_error)?;
        tracing::info!(node = %name, id, "voter removed");
        Ok(())
    }

    async fn bootstrap(&self, member: Member) -> Result<(), SubmitError> {
        let mut nodes = BTreeMap::new();
        nodes.insert(member.raft_id(), member.peer_node());

        match self.raft.initialize(nodes).await {
            Ok(()) => {
                tracing::info!(node = %member.name, "bootstrapped single-node cluster");
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(e))) => {
                tracing::info!(node = %member.name, "cluster already initialized: {}", e);
                Ok(())
            }
            Err(RaftError::APIError(e)) => Err(SubmitError::Rejected(e.to_string())),
            Err(RaftError::Fatal(f)) => Err(SubmitError::Fatal(f.to_string())),
        }
    }
}

/// In-process doubles for exercising the key-value core without openraft.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::state_machine::KvStateMachine;
    use crate::type_config::LogId;
    use openraft::CommittedLeaderId;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Single-process consensus that applies entries straight to a state
    /// machine, or never commits them at all.
    pub(crate) struct FakeConsensus {
        pub(crate) state_machine: Arc<KvStateMachine>,
        pub(crate) leadership: Mutex<Leadership>,
        pub(crate) members: Mutex<Vec<Member>>,
        pub(crate) commits: bool,
        /// Member added by another caller just before the next `add_voter`.
        pub(crate) concurrent_join: Mutex<Option<Member>>,
        next_index: AtomicU64,
    }

    impl FakeConsensus {
        pub(crate) fn leader() -> Self {
            Self {
                state_machine: Arc::new(KvStateMachine::new()),
                leadership: Mutex::new(Leadership::leader()),
                members: Mutex::new(vec![Member::voter("n1", "127.0.0.1:7001")]),
                commits: true,
                concurrent_join: Mutex::new(None),
                next_index: AtomicU64::new(1),
            }
        }

        pub(crate) fn follower(hint: &str) -> Self {
            let fake = Self::leader();
            *fake.leadership.lock() = Leadership::follower(hint);
            fake
        }

        pub(crate) fn never_commits() -> Self {
            Self {
                commits: false,
                ..Self::leader()
            }
        }

        pub(crate) fn submitted(&self) -> u64 {
            self.next_index.load(Ordering::SeqCst) - 1
        }
    }

    #[async_trait]
    impl Consensus for FakeConsensus {
        async fn submit(
            &self,
            payload: Vec<u8>,
            _timeout: Duration,
        ) -> Result<CommandResponse, SubmitError> {
            let index = self.next_index.fetch_add(1, Ordering::SeqCst);
            if !self.commits {
                // Ignores the deadline; callers must enforce their own.
                return std::future::pending().await;
            }
            let log_id = LogId::new(CommittedLeaderId::new(1, 1), index);
            self.state_machine
                .apply(log_id, &payload)
                .map_err(|e| SubmitError::Fatal(e.to_string()))
        }

        fn leadership(&self) -> Leadership {
            self.leadership.lock().clone()
        }

        fn members(&self) -> Vec<Member> {
            self.members.lock().clone()
        }

        /// Like openraft, an id already in the config keeps its recorded
        /// address.
        async fn add_voter(&self, member: Member) -> Result<(), SubmitError> {
            let mut members = self.members.lock();
            if let Some(racer) = self.concurrent_join.lock().take() {
                members.push(racer);
            }
            match members.iter_mut().find(|m| m.name == member.name) {
                Some(existing) => existing.voter = true,
                None => members.push(member),
            }
            Ok(())
        }

        async fn remove_voter(&self, name: &str) -> Result<(), SubmitError> {
            self.members.lock().retain(|m| m.name != name);
            Ok(())
        }

        async fn bootstrap(&self, member: Member) -> Result<(), SubmitError> {
            *self.members.lock() = vec![member];
            *self.leadership.lock() = Leadership::leader();
            Ok(())
        }
    }
}
