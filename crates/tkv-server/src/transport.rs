use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint};

use tkv_consensus::{Envelope, SnapshotChunk, Transport};
use tkv_proto::v1::{raft_service_client::RaftServiceClient, RaftMessage};
use tkv_types::{NodeId, TkvError};

use crate::convert::chunk_to_proto;

const PEER_QUEUE: usize = 1024;

struct PeerLink {
    queue: mpsc::Sender<Envelope>,
    client: RaftServiceClient<Channel>,
}

/// gRPC transport to the other cluster members.
///
/// Each peer gets a bounded queue drained by its own task, so messages to
/// one peer stay ordered and a slow peer never blocks the others.
pub struct GrpcTransport {
    id: NodeId,
    peers: HashMap<NodeId, PeerLink>,
}

impl GrpcTransport {
    /// `peers` maps node ids to cluster addresses (`host:port`). Must be
    /// called inside a tokio runtime; connections are made lazily.
    pub fn new(id: NodeId, peers: &HashMap<NodeId, String>, connect_timeout: Duration) -> Result<Self, TkvError> {
        let mut links = HashMap::new();
        for (&peer, addr) in peers {
            if peer == id {
                continue;
            }
            let channel = Endpoint::from_shared(format!("http://{addr}"))
                .map_err(|e| TkvError::InvalidArgument(format!("peer {peer} address {addr}: {e}")))?
                .connect_timeout(connect_timeout)
                .connect_lazy();
            let client = RaftServiceClient::new(channel);
            let (queue, rx) = mpsc::channel(PEER_QUEUE);
            tokio::spawn(pump(id, peer, client.clone(), rx));
            links.insert(peer, PeerLink { queue, client });
        }
        Ok(GrpcTransport { id, peers: links })
    }
}

async fn pump(id: NodeId, peer: NodeId, mut client: RaftServiceClient<Channel>, mut rx: mpsc::Receiver<Envelope>) {
    while let Some(env) = rx.recv().await {
        let data = match env.encode() {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(node_id = id, peer, error = %e, "failed to encode raft message");
                continue;
            }
        };
        if let Err(status) = client.raft(RaftMessage { data }).await {
            tracing::debug!(node_id = id, peer, code = ?status.code(), "raft message not delivered");
        }
    }
}

impl Transport for GrpcTransport {
    fn send(&self, env: Envelope) {
        let Some(link) = self.peers.get(&env.to) else {
            tracing::warn!(node_id = self.id, to = env.to, "no route to peer");
            return;
        };
        if link.queue.try_send(env).is_err() {
            tracing::debug!(node_id = self.id, "peer queue full, dropping message");
        }
    }

    async fn send_snapshot(&self, to: NodeId, chunks: Vec<SnapshotChunk>) -> Result<(), TkvError> {
        let mut client = self
            .peers
            .get(&to)
            .map(|link| link.client.clone())
            .ok_or_else(|| TkvError::SnapshotTransferFailed(format!("no route to node {to}")))?;
        let stream = tokio_stream::iter(chunks.into_iter().map(chunk_to_proto));
        client
            .snapshot(stream)
            .await
            .map(|_| ())
            .map_err(|status| TkvError::SnapshotTransferFailed(status.message().to_string()))
    }
}
