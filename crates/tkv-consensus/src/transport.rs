use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use tkv_types::{NodeId, TkvError};

use crate::message::{Envelope, Message};
use crate::replica::Request;
use crate::snapshot::{SnapshotChunk, SnapshotReceiver};

/// Outbound side of the peer network.
pub trait Transport: Send + Sync + 'static {
    /// Best effort; delivery failures are silent and Raft retries on its own.
    fn send(&self, env: Envelope);

    /// Stream a chunked snapshot to `to`. Resolves once the receiver has
    /// reassembled and accepted the whole image.
    fn send_snapshot(
        &self,
        to: NodeId,
        chunks: Vec<SnapshotChunk>,
    ) -> impl Future<Output = Result<(), TkvError>> + Send;
}

/// Inbound side: hands peer messages to a running replica.
#[derive(Clone)]
pub struct Mailbox {
    pub(crate) tx: mpsc::Sender<Request>,
}

impl Mailbox {
    /// Queue a protocol message without waiting. A full queue drops it.
    pub fn deliver(&self, env: Envelope) -> Result<(), TkvError> {
        match self.tx.try_send(Request::Raft(env)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(Request::Raft(env))) => {
                tracing::debug!(from = env.from, to = env.to, kind = env.message.kind(), "mailbox full, dropping");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TkvError::Stopped),
        }
    }

    /// Queue a reassembled snapshot, waiting for room.
    pub async fn deliver_snapshot(&self, env: Envelope) -> Result<(), TkvError> {
        if !matches!(env.message, Message::InstallSnapshot { .. }) {
            return Err(TkvError::InvalidArgument(format!(
                "expected a snapshot, got {}",
                env.message.kind()
            )));
        }
        self.tx.send(Request::Raft(env)).await.map_err(|_| TkvError::Stopped)
    }
}

// ---------------------------------------------------------------------------
// LocalNetwork: in-process transport for tests and single-binary clusters
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Links {
    routes: HashMap<NodeId, Mailbox>,
    isolated: HashSet<NodeId>,
    interrupt_snapshots: bool,
}

/// A switchboard connecting replicas in one process. Nodes can be cut off
/// and reconnected to simulate partitions and crashes.
#[derive(Default)]
pub struct LocalNetwork {
    links: RwLock<Links>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transport(self: &Arc<Self>, id: NodeId) -> Arc<LocalTransport> {
        Arc::new(LocalTransport { id, net: Arc::clone(self) })
    }

    /// Route messages for `id` to `mailbox`, replacing any previous route.
    pub fn register(&self, id: NodeId, mailbox: Mailbox) {
        self.links.write().routes.insert(id, mailbox);
    }

    /// Drop all traffic to and from `id`.
    pub fn isolate(&self, id: NodeId) {
        self.links.write().isolated.insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        self.links.write().isolated.remove(&id);
    }

    /// While set, every snapshot stream breaks off halfway.
    pub fn interrupt_snapshots(&self, on: bool) {
        self.links.write().interrupt_snapshots = on;
    }

    fn route(&self, from: NodeId, to: NodeId) -> Option<Mailbox> {
        let links = self.links.read();
        if links.isolated.contains(&from) || links.isolated.contains(&to) {
            return None;
        }
        links.routes.get(&to).cloned()
    }
}

pub struct LocalTransport {
    id: NodeId,
    net: Arc<LocalNetwork>,
}

impl Transport for LocalTransport {
    fn send(&self, env: Envelope) {
        if let Some(mailbox) = self.net.route(self.id, env.to) {
            let _ = mailbox.deliver(env);
        }
    }

    async fn send_snapshot(&self, to: NodeId, chunks: Vec<SnapshotChunk>) -> Result<(), TkvError> {
        let unreachable = || TkvError::SnapshotTransferFailed(format!("node {to} unreachable"));
        let mailbox = self.net.route(self.id, to).ok_or_else(unreachable)?;
        let cut_at = if self.net.links.read().interrupt_snapshots { chunks.len() / 2 } else { usize::MAX };

        let mut receiver = SnapshotReceiver::new();
        let mut complete = None;
        for (i, chunk) in chunks.into_iter().enumerate() {
            if i >= cut_at {
                return Err(TkvError::SnapshotTransferFailed("stream interrupted".into()));
            }
            complete = receiver.receive(chunk)?;
        }
        let env = complete
            .ok_or_else(|| TkvError::SnapshotTransferFailed("stream ended before trailer".into()))?;
        // The route may have been cut while streaming.
        self.net.route(self.id, to).ok_or_else(unreachable)?;
        mailbox.deliver_snapshot(env).await
    }
}
