//! Integration tests for a bootstrapped single-node cluster.
//!
//! These tests run a real openraft node with its HTTP RPC server bound to an
//! ephemeral port.

use raftkv::{KvError, KvNode, KvStore, NodeConfig};
use std::collections::BTreeMap;
use std::time::Duration;
use tempfile::TempDir;

const LEADER_TIMEOUT: Duration = Duration::from_secs(10);

async fn start_leader(dir: &TempDir, config: impl FnOnce(NodeConfig) -> NodeConfig) -> KvNode {
    let config = config(NodeConfig::new("node1", dir.path()).with_raft_addr("127.0.0.1:0"));
    let node = KvNode::start(config).await.unwrap();
    node.bootstrap().await.unwrap();
    node.wait_for_leader(LEADER_TIMEOUT).await.unwrap();
    node
}

fn pairs(items: &[(&str, &str)]) -> BTreeMap<String, String> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn bootstrapped_node_serves_reads_and_writes() {
    let dir = TempDir::new().unwrap();
    let node = start_leader(&dir, |c| c).await;
    let kv = node.kv();

    assert!(kv.is_leader().is_leader);

    kv.put(pairs(&[("a", "1")])).await.unwrap();
    assert_eq!(kv.get("a").await.unwrap(), Some("1".to_string()));

    kv.put(pairs(&[("a", "2"), ("b", "")])).await.unwrap();
    assert_eq!(kv.get("a").await.unwrap(), Some("2".to_string()));
    assert_eq!(kv.get("b").await.unwrap(), Some(String::new()));

    kv.delete("a").await.unwrap();
    assert_eq!(kv.get("a").await.unwrap(), None);

    // Deleting an absent key is not an error.
    kv.delete("a").await.unwrap();

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn bootstrap_twice_is_harmless() {
    let dir = TempDir::new().unwrap();
    let node = start_leader(&dir, |c| c).await;

    node.bootstrap().await.unwrap();
    assert!(node.kv().is_leader().is_leader);

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn unbootstrapped_node_is_not_leader() {
    let dir = TempDir::new().unwrap();
    let node = KvNode::start(NodeConfig::new("lonely", dir.path()).with_raft_addr("127.0.0.1:0"))
        .await
        .unwrap();

    let leadership = node.kv().is_leader();
    assert!(!leadership.is_leader);
    assert!(leadership.leader_hint.is_empty());
    assert!(matches!(
        node.kv().get("a").await,
        Err(KvError::NotLeader { .. })
    ));

    node.shutdown().await.unwrap();
}

fn snapshot_files(dir: &TempDir) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir.path().join("snapshots"))
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "snap"))
        .collect()
}

#[tokio::test]
async fn snapshot_is_written_to_data_dir() {
    let dir = TempDir::new().unwrap();
    let node = start_leader(&dir, |c| c.with_snapshot_threshold(5)).await;
    let kv = node.kv();

    for i in 0..10 {
        let (key, value) = (format!("k{i}"), format!("v{i}"));
        kv.put(pairs(&[(key.as_str(), value.as_str())]))
            .await
            .unwrap();
    }
    node.trigger_snapshot().await.unwrap();

    node.raft()
        .wait(Some(LEADER_TIMEOUT))
        .metrics(|m| m.snapshot.is_some(), "snapshot built")
        .await
        .unwrap();

    assert!(!snapshot_files(&dir).is_empty());

    // Compaction does not change what clients see.
    assert_eq!(kv.get("k9").await.unwrap(), Some("v9".to_string()));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn repeated_snapshots_keep_one_file() {
    let dir = TempDir::new().unwrap();
    let node = start_leader(&dir, |c| c).await;
    let kv = node.kv();

    for i in 0..5 {
        let (key, value) = (format!("k{i}"), format!("v{i}"));
        kv.put(pairs(&[(key.as_str(), value.as_str())]))
            .await
            .unwrap();

        let applied = node.raft().metrics().borrow().last_applied.map(|l| l.index);
        node.trigger_snapshot().await.unwrap();
        node.raft()
            .wait(Some(LEADER_TIMEOUT))
            .metrics(
                |m| m.snapshot.map(|l| l.index) >= applied,
                "snapshot caught up",
            )
            .await
            .unwrap();
    }

    let files = snapshot_files(&dir);
    assert_eq!(files.len(), 1, "{files:?}");

    let latest: BTreeMap<String, String> =
        serde_json::from_slice(&std::fs::read(&files[0]).unwrap()).unwrap();
    assert_eq!(latest.len(), 5);
    assert_eq!(latest.get("k4").map(String::as_str), Some("v4"));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn health_endpoint_reports_halt() {
    let dir = TempDir::new().unwrap();
    let node = start_leader(&dir, |c| c).await;
    let url = format!("http://{}/health", node.raft_addr());

    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["current_leader"], node.raft().metrics().borrow().id);

    node.state_machine().halt("entry 7 failed to decode");

    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "halted");
    assert_eq!(body["reason"], "entry 7 failed to decode");
    assert!(matches!(
        node.kv().get("a").await,
        Err(KvError::Halted(_))
    ));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn membership_lists_bootstrap_node() {
    let dir = TempDir::new().unwrap();
    let node = start_leader(&dir, |c| c).await;

    // Re-joining the node itself at its own address is a no-op.
    node.kv().join("node1", node.raft_addr()).await.unwrap();

    let err = node.kv().join("node1", "127.0.0.1:1").await.unwrap_err();
    assert!(matches!(err, KvError::Conflict { .. }));

    node.shutdown().await.unwrap();
}
