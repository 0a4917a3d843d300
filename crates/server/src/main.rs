//! HTTP server for the raftkv replicated key-value store.
//!
//! Starts a Raft node, then either bootstraps a new single-node cluster or
//! asks an existing node to add it, and serves the client API.

mod api;
mod error;
mod join;

use anyhow::{Context, Result};
use clap::Parser;
use raftkv::{KvNode, NodeConfig};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "raftkv-server", about = "Replicated key-value store node")]
struct Args {
    /// Address the client API listens on
    #[arg(long)]
    aaddr: String,

    /// Address the Raft RPC server listens on
    #[arg(long)]
    raddr: String,

    /// API address of an existing node to join, if any
    #[arg(long)]
    join: Option<String>,

    /// Node name. Defaults to the Raft address
    #[arg(long)]
    id: Option<String>,

    /// Storage directory. Defaults to the node name
    #[arg(long)]
    dir: Option<PathBuf>,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let id = args.id.unwrap_or_else(|| args.raddr.clone());
    let dir = args.dir.unwrap_or_else(|| PathBuf::from(&id));

    tracing::info!(node = %id, api = %args.aaddr, "starting raftkv node");
    tracing::info!(raft = %args.raddr, dir = %dir.display(), "raft storage");

    let node = KvNode::start(NodeConfig::new(id, dir).with_raft_addr(args.raddr))
        .await
        .context("raft failed to start")?;

    match &args.join {
        None => node.bootstrap().await?,
        Some(leader) => join::join_cluster(leader, node.name(), node.raft_addr()).await?,
    }

    let listener = TcpListener::bind(&args.aaddr)
        .await
        .with_context(|| format!("failed to bind API address {}", args.aaddr))?;
    tracing::info!(addr = %listener.local_addr()?, "API listening, press Ctrl+C to shut down");

    axum::serve(listener, api::router(node.kv()))
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    node.shutdown().await?;
    tracing::info!("terminated");
    Ok(())
}
