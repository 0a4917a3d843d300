//! Client side of `POST /join`, used when a node starts with `--join`.

use anyhow::{Result, bail};
use raftkv::network::base_url;
use serde_json::json;
use std::time::Duration;

const JOIN_ATTEMPTS: u32 = 5;
const JOIN_BACKOFF: Duration = Duration::from_millis(500);

/// Ask the node serving the API at `leader_api` to add this node.
///
/// Retries briefly so nodes started together can find each other; a
/// rejection with a client error status is returned immediately.
pub async fn join_cluster(leader_api: &str, id: &str, raft_addr: &str) -> Result<()> {
    let url = format!("{}/join", base_url(leader_api));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let body = json!({ "id": id, "addr": raft_addr });

    let mut attempt = 1;
    loop {
        match client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(%url, "joined cluster");
                return Ok(());
            }
            Ok(response) if response.status().is_client_error() => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                bail!("join rejected by {}: {} {}", url, status, text.trim());
            }
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                if attempt >= JOIN_ATTEMPTS {
                    bail!("join failed at {}: {} {}", url, status, text.trim());
                }
                tracing::warn!(%url, %status, attempt, "join failed, retrying");
            }
            Err(e) => {
                if attempt >= JOIN_ATTEMPTS {
                    bail!("could not reach {}: {}", url, e);
                }
                tracing::warn!(%url, error = %e, attempt, "join request failed, retrying");
            }
        }
        attempt += 1;
        tokio::time::sleep(JOIN_BACKOFF).await;
    }
}
