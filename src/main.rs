use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use raft::file_storage::{open_stores, FsyncPolicy};
use raft::kv::KvStore;
use raft::options::RaftOptions;
use raft::transport::{self, TcpTransport};
use raft::{client_api, server, NodeId};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FsyncMode {
    Always,
    Batch,
    Adaptive,
}

#[derive(Parser)]
#[command(name = "raft-node", about = "Run one member of a Raft-replicated key-value store")]
struct Args {
    /// This node's ID (must be unique in the cluster).
    #[arg(long)]
    id: String,

    /// TCP address to listen on for Raft RPCs.
    #[arg(long)]
    addr: SocketAddr,

    /// A peer in the form ID=ADDR. Repeat for each peer.
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(NodeId, SocketAddr)>,

    /// Directory for persistent state (meta.json, log.jsonl, snapshot.bin).
    #[arg(long)]
    data_dir: PathBuf,

    /// Serve the HTTP key-value API on this address.
    #[arg(long)]
    client_addr: Option<SocketAddr>,

    #[arg(long, default_value_t = 150)]
    election_timeout_min_ms: u64,

    #[arg(long, default_value_t = 300)]
    election_timeout_max_ms: u64,

    #[arg(long, default_value_t = 50)]
    heartbeat_interval_ms: u64,

    #[arg(long, default_value_t = 10_000)]
    snapshot_threshold: u64,

    /// Skip the pre-vote round before elections.
    #[arg(long)]
    no_pre_vote: bool,

    #[arg(long, value_enum, default_value_t = FsyncMode::Always)]
    fsync: FsyncMode,

    /// Batch window for `--fsync batch` and `--fsync adaptive`.
    #[arg(long, default_value_t = 10)]
    fsync_interval_ms: u64,

    /// Write rate above which `--fsync adaptive` starts batching.
    #[arg(long, default_value_t = 200)]
    fsync_max_rate: u32,
}

impl Args {
    fn fsync_policy(&self) -> FsyncPolicy {
        match self.fsync {
            FsyncMode::Always => FsyncPolicy::Always,
            FsyncMode::Batch => FsyncPolicy::Batch {
                interval_ms: self.fsync_interval_ms,
            },
            FsyncMode::Adaptive => FsyncPolicy::Adaptive {
                interval_ms: self.fsync_interval_ms,
                max_synced_writes_per_sec: self.fsync_max_rate,
            },
        }
    }

    fn options(&self) -> RaftOptions {
        let id = NodeId::new(self.id.clone());
        let members = std::iter::once(id.clone()).chain(self.peers.iter().map(|(p, _)| p.clone()));
        let mut options = RaftOptions::new(id, members);
        options.election_timeout_min_ms = self.election_timeout_min_ms;
        options.election_timeout_max_ms = self.election_timeout_max_ms;
        options.heartbeat_interval_ms = self.heartbeat_interval_ms;
        options.snapshot_threshold = self.snapshot_threshold;
        options.enable_pre_vote = !self.no_pre_vote;
        options
    }
}

fn parse_peer(s: &str) -> Result<(NodeId, SocketAddr), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("--peer must be ID=ADDR, got: {s}"))?;
    let addr = addr
        .parse()
        .map_err(|e| format!("bad address in --peer {s}: {e}"))?;
    Ok((NodeId::from(id), addr))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let options = args.options().validate()?;

    std::fs::create_dir_all(&args.data_dir)?;
    let stores = open_stores(&args.data_dir, args.fsync_policy())?;

    let peers: HashMap<NodeId, SocketAddr> = args.peers.iter().cloned().collect();
    let transport = TcpTransport::new(options.node_id.clone(), peers, options.snapshot_chunk_bytes);

    let (handle, mut node) = server::spawn(options, stores, KvStore::new(), Arc::new(transport))?;

    let listener = TcpListener::bind(args.addr).await?;
    info!(node = %args.id, addr = %args.addr, "raft rpc listening");
    let rpc_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = transport::serve(listener, rpc_handle).await {
            error!(error = %e, "raft rpc listener failed");
        }
    });

    if let Some(client_addr) = args.client_addr {
        let listener = TcpListener::bind(client_addr).await?;
        let api_handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = client_api::serve(listener, api_handle).await {
                error!(error = %e, "client api failed");
            }
        });
    }

    tokio::select! {
        joined = &mut node => {
            joined??;
            warn!("raft node stopped on its own");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            handle.shutdown().await;
            node.await??;
        }
    }

    Ok(())
}
