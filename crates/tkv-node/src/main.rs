use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use tkv_consensus::{RaftConfig as NodeRaftConfig, Replica, ReplicaConfig};
use tkv_server::{serve_client, serve_cluster, GrpcTransport, ScanLimits};
use tkv_storage::fjall::{FjallLogStorage, FjallStateMachine, FjallStore};
use tkv_types::NodeId;

#[derive(clap::Parser, Debug)]
#[command(name = "tkv-node", about = "Raft-replicated key-value node")]
struct Cli {
    #[arg(long)]
    node_id: NodeId,
    #[arg(long, default_value = "0.0.0.0:17000")]
    client_addr: String,
    #[arg(long, default_value = "0.0.0.0:17001")]
    cluster_addr: String,
    /// Peer specs: "id=cluster_addr[,client_addr]", repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `storage.data_dir`
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    data_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct RaftConfig {
    tick_interval_ms: u64,
    election_tick: u32,
    heartbeat_tick: u32,
    max_append_entries: usize,
    snapshot_threshold: u64,
    snapshot_chunk_bytes: usize,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    request_timeout_ms: u64,
    default_scan_limit: usize,
    max_scan_limit: usize,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    storage: StorageConfig,
    raft: RaftConfig,
    server: ServerConfig,
    observability: ObservabilityConfig,
}

#[derive(Debug, PartialEq, Eq)]
struct Peer {
    id: NodeId,
    cluster_addr: String,
    client_addr: Option<String>,
}

fn parse_peer(spec: &str) -> anyhow::Result<Peer> {
    let (id, addrs) = spec
        .split_once('=')
        .with_context(|| format!("peer spec '{spec}' is not id=addr"))?;
    let id = id.trim().parse().with_context(|| format!("invalid peer id in '{spec}'"))?;
    let (cluster_addr, client_addr) = match addrs.split_once(',') {
        Some((cluster, client)) => (cluster.trim(), Some(client.trim().to_string())),
        None => (addrs.trim(), None),
    };
    if cluster_addr.is_empty() {
        anyhow::bail!("peer {id} has no cluster address");
    }
    Ok(Peer { id, cluster_addr: cluster_addr.to_string(), client_addr })
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let mut figment = Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));
    if let Some(config_path) = path {
        figment = figment.merge(Toml::file_exact(config_path));
    }
    figment
        .merge(Env::prefixed("TINYKV_").split("__"))
        .extract()
        .context("failed to load configuration")
}

fn replica_config(config: &Config, id: NodeId, voters: Vec<NodeId>) -> ReplicaConfig {
    let mut raft = NodeRaftConfig::new(id, voters);
    raft.election_tick = config.raft.election_tick;
    raft.heartbeat_tick = config.raft.heartbeat_tick;
    raft.max_append_entries = config.raft.max_append_entries;

    let mut replica = ReplicaConfig::new(raft);
    replica.tick_interval = Duration::from_millis(config.raft.tick_interval_ms);
    replica.snapshot_threshold = config.raft.snapshot_threshold;
    replica.snapshot_chunk_size = config.raft.snapshot_chunk_bytes;
    replica.request_timeout = Duration::from_millis(config.server.request_timeout_ms);
    replica
}

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&observability.log_level));
    match observability.log_format.as_str() {
        "json" => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        _ => tracing_subscriber::fmt().pretty().with_env_filter(filter).init(),
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_ref())?;
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    init_tracing(&config.observability);

    let peers = cli.peers.iter().map(|s| parse_peer(s)).collect::<anyhow::Result<Vec<_>>>()?;
    let mut voters: BTreeSet<NodeId> = peers.iter().map(|p| p.id).collect();
    voters.insert(cli.node_id);
    let cluster_addrs: HashMap<NodeId, String> =
        peers.iter().map(|p| (p.id, p.cluster_addr.clone())).collect();
    let mut client_addrs: HashMap<NodeId, String> = peers
        .iter()
        .filter_map(|p| p.client_addr.clone().map(|a| (p.id, a)))
        .collect();
    client_addrs.insert(cli.node_id, cli.client_addr.clone());

    tracing::info!(
        node_id = cli.node_id,
        client_addr = %cli.client_addr,
        cluster_addr = %cli.cluster_addr,
        voters = ?voters,
        data_dir = %config.storage.data_dir.display(),
        "node starting"
    );

    let client_addr: SocketAddr = cli
        .client_addr
        .parse()
        .with_context(|| format!("invalid client_addr: {}", cli.client_addr))?;
    let cluster_addr: SocketAddr = cli
        .cluster_addr
        .parse()
        .with_context(|| format!("invalid cluster_addr: {}", cli.cluster_addr))?;

    let replica_config = replica_config(&config, cli.node_id, voters.into_iter().collect());
    let path = config.storage.data_dir.join(format!("node-{}", cli.node_id));
    let store = FjallStore::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
    let transport = GrpcTransport::new(cli.node_id, &cluster_addrs, replica_config.request_timeout)?;
    let handle = Replica::spawn(
        replica_config,
        Arc::new(FjallLogStorage(store.clone())),
        Arc::new(FjallStateMachine::new(store)),
        Arc::new(transport),
    )
    .await
    .context("failed to start replica")?;
    let raft = Arc::new(handle.clone());

    let (stop_tx, stop_rx) = watch::channel(false);
    let limits = ScanLimits { default: config.server.default_scan_limit, max: config.server.max_scan_limit };
    let servers = async {
        tokio::try_join!(
            serve_client(client_addr, raft.clone(), client_addrs, limits, stopped(stop_rx.clone())),
            serve_cluster(cluster_addr, raft, stopped(stop_rx)),
        )
        .map(|_| ())
    };
    tokio::pin!(servers);

    let replica_exit = tokio::select! {
        served = &mut servers => {
            handle.shutdown().await;
            return served;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            Ok(())
        }
        exit = handle.stopped() => exit,
    };

    // Drain both listeners before the replica goes away.
    let _ = stop_tx.send(true);
    servers.await?;
    handle.shutdown().await;
    replica_exit.with_context(|| format!("replica {} failed", cli.node_id))?;
    tracing::info!(node_id = cli.node_id, "node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_spec_with_and_without_client_addr() {
        assert_eq!(
            parse_peer("2=10.0.0.2:17001").unwrap(),
            Peer { id: 2, cluster_addr: "10.0.0.2:17001".into(), client_addr: None }
        );
        assert_eq!(
            parse_peer("3=10.0.0.3:17001,10.0.0.3:17000").unwrap(),
            Peer {
                id: 3,
                cluster_addr: "10.0.0.3:17001".into(),
                client_addr: Some("10.0.0.3:17000".into()),
            }
        );
        assert!(parse_peer("10.0.0.2:17001").is_err());
        assert!(parse_peer("x=10.0.0.2:17001").is_err());
        assert!(parse_peer("2=").is_err());
    }

    #[test]
    fn default_config_produces_valid_replica_config() {
        let config = load_config(None).unwrap();
        let replica = replica_config(&config, 1, vec![1, 2, 3]);
        replica.validate().unwrap();
        assert_eq!(replica.raft.election_tick, 10);
        assert_eq!(replica.tick_interval, Duration::from_millis(100));
        assert_eq!(config.server.default_scan_limit, 100);
    }
}
