//! A running raftkv node: openraft, its RPC server and the KV front end.

use crate::config::{ConfigError, NodeConfig};
use crate::consensus::{Consensus, Member, OpenRaftConsensus, SubmitError};
use crate::http_server::{start_server, RaftHttpState, ServerHandle};
use crate::kv::RaftKv;
use crate::log_storage::{LogStore, MemRaftStore};
use crate::network::HttpNetworkFactory;
use crate::state_machine::KvStateMachine;
use crate::type_config::TypeConfig;
use crate::{NodeId, RaftNode};
use openraft::storage::Adaptor;
use openraft::Raft;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors starting or operating a node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid raft config: {0}")]
    RaftConfig(#[from] openraft::ConfigError),

    #[error("failed to bind raft address {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("raft stopped: {0}")]
    Fatal(#[from] openraft::error::Fatal<NodeId>),

    #[error(transparent)]
    Membership(#[from] SubmitError),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("shutdown failed: {0}")]
    Shutdown(String),
}

/// One cluster member with its Raft RPC server running.
pub struct KvNode {
    name: String,
    raft_addr: String,
    raft: Arc<RaftNode>,
    state_machine: Arc<KvStateMachine>,
    consensus: Arc<OpenRaftConsensus>,
    kv: Arc<RaftKv>,
    server: ServerHandle,
}

impl KvNode {
    /// Start Raft and its RPC server. The node is not part of any cluster
    /// until [`KvNode::bootstrap`] or a leader's `join`.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let node_id = config.node_id();
        let raft_config = Arc::new(config.to_openraft_config().validate()?);

        let state_machine = Arc::new(KvStateMachine::new());
        let store = Arc::new(
            MemRaftStore::new(state_machine.clone()).with_snapshot_dir(config.snapshot_dir()),
        );
        let (log_store, sm_store) = Adaptor::<TypeConfig, LogStore>::new(store);
        let network = HttpNetworkFactory::new(node_id)?;

        let raft = Arc::new(
            Raft::<TypeConfig>::new(node_id, raft_config, network, log_store, sm_store).await?,
        );

        let bind_err = |source| NodeError::Bind {
            addr: config.raft_addr.clone(),
            source,
        };
        let listen = tokio::net::lookup_host(&config.raft_addr)
            .await
            .map_err(bind_err)?
            .next()
            .ok_or_else(|| bind_err(io::Error::other("address did not resolve")))?;
        let server = start_server(
            listen,
            RaftHttpState::new(raft.clone(), state_machine.clone()),
        )
        .await
        .map_err(bind_err)?;

        let raft_addr = if listen.port() == 0 {
            server.local_addr().to_string()
        } else {
            config.raft_addr.clone()
        };

        let consensus = Arc::new(OpenRaftConsensus::new(raft.clone()));
        let kv = Arc::new(
            RaftKv::new(consensus.clone(), state_machine.clone())
                .with_apply_timeout(config.apply_timeout()),
        );

        tracing::info!(node = %config.name, id = node_id, %raft_addr, "raft node started");

        Ok(Self {
            name: config.name,
            raft_addr,
            raft,
            state_machine,
            consensus,
            kv,
            server,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address peers use to reach this node's Raft RPC server.
    pub fn raft_addr(&self) -> &str {
        &self.raft_addr
    }

    pub fn member(&self) -> Member {
        Member::voter(self.name.clone(), self.raft_addr.clone())
    }

    pub fn kv(&self) -> Arc<RaftKv> {
        self.kv.clone()
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    pub fn state_machine(&self) -> &Arc<KvStateMachine> {
        &self.state_machine
    }

    /// Form a single-node cluster with this node as its only voter.
    pub async fn bootstrap(&self) -> Result<(), NodeError> {
        self.consensus.bootstrap(self.member()).await?;
        Ok(())
    }

    /// Wait until this node sees some leader.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId, NodeError> {
        let metrics = self
            .raft
            .wait(Some(timeout))
            .metrics(|m| m.current_leader.is_some(), "leader elected")
            .await
            .map_err(|e| NodeError::Timeout(e.to_string()))?;
        metrics
            .current_leader
            .ok_or_else(|| NodeError::Timeout("leader elected".into()))
    }

    /// Ask openraft to build a snapshot now.
    pub async fn trigger_snapshot(&self) -> Result<(), NodeError> {
        self.raft.trigger().snapshot().await?;
        Ok(())
    }

    /// Stop Raft and the RPC server.
    pub async fn shutdown(mut self) -> Result<(), NodeError> {
        tracing::info!(node = %self.name, "shutting down raft node");
        self.raft
            .shutdown()
            .await
            .map_err(|e| NodeError::Shutdown(e.to_string()))?;
        self.server.shutdown();
        self.server
            .wait()
            .await
            .map_err(|e| NodeError::Shutdown(e.to_string()))
    }
}
