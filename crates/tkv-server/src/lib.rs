mod convert;
mod kv_service;
mod raft_service;
mod transport;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tkv_consensus::RaftKv;
use tkv_proto::v1::{raft_service_server::RaftServiceServer, tiny_kv_server::TinyKvServer};
use tkv_types::NodeId;
use tonic_reflection::server::Builder as ReflectionBuilder;

use kv_service::KvServiceImpl;
use raft_service::RaftServiceImpl;

pub use convert::{LEADER_ADDR_HEADER, LEADER_ID_HEADER};
pub use kv_service::ScanLimits;
pub use transport::GrpcTransport;

/// Serve the client API. `client_addrs` maps node ids to their client
/// addresses and is used to redirect callers to the leader.
pub async fn serve_client<R: RaftKv>(
    addr: SocketAddr,
    raft: Arc<R>,
    client_addrs: HashMap<NodeId, String>,
    limits: ScanLimits,
    shutdown: impl std::future::Future<Output = ()> + Send,
) -> anyhow::Result<()> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(tkv_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .context("failed to build reflection service")?;
    tracing::info!(%addr, "client gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(TinyKvServer::new(KvServiceImpl::new(raft, Arc::new(client_addrs), limits)))
        .add_service(reflection)
        .serve_with_shutdown(addr, shutdown)
        .await
        .map_err(Into::into)
}

/// Serve peer replication traffic.
pub async fn serve_cluster<R: RaftKv>(
    addr: SocketAddr,
    raft: Arc<R>,
    shutdown: impl std::future::Future<Output = ()> + Send,
) -> anyhow::Result<()> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(tkv_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .context("failed to build reflection service")?;
    tracing::info!(%addr, "cluster gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(RaftServiceServer::new(RaftServiceImpl::new(raft)))
        .add_service(reflection)
        .serve_with_shutdown(addr, shutdown)
        .await
        .map_err(Into::into)
}
