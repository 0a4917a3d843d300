//! Raft network implementation.
//!
//! Peers reach each other over HTTP. The target address comes from the
//! [`PeerNode`] recorded in the membership config, so a node joined at
//! runtime is reachable without any static peer list.

use crate::type_config::{PeerNode, TypeConfig};
use crate::NodeId;
use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use std::io;
use std::time::Duration;

/// HTTP-based network factory.
#[derive(Clone)]
pub struct HttpNetworkFactory {
    /// This node's ID.
    node_id: NodeId,
    /// Shared HTTP client for connection pooling.
    client: reqwest::Client,
}

impl HttpNetworkFactory {
    /// Create a new HTTP network factory.
    pub fn new(node_id: NodeId) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self { node_id, client })
    }
}

impl std::fmt::Debug for HttpNetworkFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpNetworkFactory")
            .field("node_id", &self.node_id)
            .finish()
    }
}

/// Base URL for a Raft address, accepting either `host:port` or a full URL.
pub fn base_url(addr: &str) -> String {
    let addr = addr.trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpNetworkFactory {
    type Network = HttpNetwork;

    async fn new_client(&mut self, target: NodeId, node: &PeerNode) -> Self::Network {
        tracing::debug!(from = self.node_id, to = %node, "opening raft client");
        HttpNetwork::new(target, base_url(&node.addr), self.client.clone())
    }
}

/// HTTP-based network client for communicating with a single Raft peer.
pub struct HttpNetwork {
    /// Target node ID.
    target: NodeId,
    /// Base URL for the target node (e.g., "http://localhost:5001").
    base_url: String,
    /// HTTP client.
    client: reqwest::Client,
}

impl HttpNetwork {
    /// Create a new HTTP network client for the given target node.
    pub fn new(target: NodeId, base_url: String, client: reqwest::Client) -> Self {
        Self {
            target,
            base_url,
            client,
        }
    }

    /// Send a POST request to the target node.
    async fn post<Req, Resp>(&self, endpoint: &str, request: &Req) -> Result<Resp, io::Error>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, endpoint);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(io::Error::other(format!(
                "HTTP {} from {}: {}",
                status, url, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

impl Clone for HttpNetwork {
    fn clone(&self) -> Self {
        Self {
            target: self.target,
            base_url: self.base_url.clone(),
            client: self.client.clone(),
        }
    }
}

impl std::fmt::Debug for HttpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpNetwork")
            .field("target", &self.target)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl RaftNetwork<TypeConfig> for HttpNetwork {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, PeerNode, RaftError<NodeId>>> {
        self.post("/raft/append_entries", &req)
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, PeerNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        self.post("/raft/install_snapshot", &req)
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, PeerNode, RaftError<NodeId>>> {
        self.post("/raft/vote", &req)
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))
    }
}
