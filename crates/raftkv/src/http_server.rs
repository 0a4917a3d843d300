//! Peer-facing HTTP server.
//!
//! Carries the three openraft RPCs between nodes, plus `/health`, which
//! answers 503 once the state machine has halted.

use crate::state_machine::{Health, KvStateMachine};
use crate::type_config::TypeConfig;
use crate::{NodeId, RaftNode};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use openraft::raft::{AppendEntriesRequest, InstallSnapshotRequest, VoteRequest};
use serde::Serialize;
use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Everything a peer request handler needs.
#[derive(Clone)]
pub struct RaftHttpState {
    pub raft: Arc<RaftNode>,
    pub state_machine: Arc<KvStateMachine>,
}

impl RaftHttpState {
    pub fn new(raft: Arc<RaftNode>, state_machine: Arc<KvStateMachine>) -> Self {
        Self {
            raft,
            state_machine,
        }
    }
}

/// Routes served on the Raft address.
pub fn create_router(state: RaftHttpState) -> Router {
    Router::new()
        .route("/raft/append_entries", post(append_entries))
        .route("/raft/vote", post(vote))
        .route("/raft/install_snapshot", post(install_snapshot))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind `addr` and serve [`create_router`] until the handle is shut down.
pub async fn start_server(addr: SocketAddr, state: RaftHttpState) -> io::Result<ServerHandle> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        axum::serve(listener, create_router(state))
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });

    tracing::debug!(%local_addr, "raft rpc server listening");
    Ok(ServerHandle {
        local_addr,
        stop_tx: Some(stop_tx),
        task,
    })
}

/// A running peer server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<io::Result<()>>,
}

impl ServerHandle {
    /// Bound address; differs from the requested one when port 0 was used.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. In-flight requests are allowed to finish.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    pub async fn wait(self) -> io::Result<()> {
        self.task
            .await
            .map_err(|e| io::Error::other(format!("raft rpc server task failed: {}", e)))?
    }
}

/// JSON body on success, the openraft error text with a 500 otherwise.
fn rpc_reply<T: Serialize, E: Debug>(rpc: &str, result: Result<T, E>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            tracing::debug!(rpc, error = ?e, "raft rpc failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{} failed: {:?}", rpc, e),
            )
                .into_response()
        }
    }
}

async fn append_entries(
    State(state): State<RaftHttpState>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> Response {
    rpc_reply("append_entries", state.raft.append_entries(req).await)
}

async fn vote(
    State(state): State<RaftHttpState>,
    Json(req): Json<VoteRequest<NodeId>>,
) -> Response {
    rpc_reply("vote", state.raft.vote(req).await)
}

async fn install_snapshot(
    State(state): State<RaftHttpState>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Response {
    rpc_reply("install_snapshot", state.raft.install_snapshot(req).await)
}

async fn health(State(state): State<RaftHttpState>) -> Response {
    let metrics = state.raft.metrics().borrow().clone();
    let (code, status, reason) = match state.state_machine.health() {
        Health::Serving => (StatusCode::OK, "healthy", None),
        Health::Halted { reason } => (StatusCode::SERVICE_UNAVAILABLE, "halted", Some(reason)),
    };

    let body = serde_json::json!({
        "status": status,
        "reason": reason,
        "node_id": metrics.id,
        "state": format!("{:?}", metrics.state),
        "current_leader": metrics.current_leader,
        "current_term": metrics.current_term,
        "last_log_index": metrics.last_log_index,
        "last_applied": metrics.last_applied.map(|l| l.index),
        "snapshot": metrics.snapshot.map(|l| l.index),
    });
    (code, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_storage::{new_log_store, LogStore};
    use crate::network::HttpNetworkFactory;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use openraft::storage::Adaptor;
    use tower::ServiceExt;

    async fn test_state() -> RaftHttpState {
        let state_machine = Arc::new(KvStateMachine::new());
        let (log_store, sm_store) =
            Adaptor::<TypeConfig, LogStore>::new(new_log_store(state_machine.clone()));
        let config = Arc::new(openraft::Config::default().validate().unwrap());
        let raft = openraft::Raft::<TypeConfig>::new(
            1,
            config,
            HttpNetworkFactory::new(1).unwrap(),
            log_store,
            sm_store,
        )
        .await
        .unwrap();
        RaftHttpState::new(Arc::new(raft), state_machine)
    }

    async fn get_health(state: RaftHttpState) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = create_router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_reports_serving_node() {
        let state = test_state().await;
        let (status, body) = get_health(state.clone()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["node_id"], 1);
        assert!(body["reason"].is_null());

        state.raft.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn health_reports_halted_node() {
        let state = test_state().await;
        state.state_machine.halt("undecodable entry at 1-1-7");

        let (status, body) = get_health(state.clone()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "halted");
        assert_eq!(body["reason"], "undecodable entry at 1-1-7");

        state.raft.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn rpc_routes_reject_get() {
        let state = test_state().await;
        let request = Request::builder()
            .uri("/raft/vote")
            .body(Body::empty())
            .unwrap();
        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        state.raft.shutdown().await.unwrap();
    }
}
