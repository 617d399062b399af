pub mod config;
pub mod message;
pub mod node;
pub mod progress;
pub mod replica;
pub mod snapshot;
pub mod transport;

use std::future::Future;

use tkv_storage::StateMachineStore;
use tkv_types::{Command, KvPair, LogId, NodeId, TkvError};

pub use config::{RaftConfig, ReplicaConfig};
pub use message::{Envelope, Message};
pub use node::{Node, NodeStatus, Role};
pub use replica::{Replica, ReplicaHandle};
pub use snapshot::{ChunkPayload, SnapshotChunk, SnapshotReceiver};
pub use transport::{LocalNetwork, LocalTransport, Mailbox, Transport};

// ---------------------------------------------------------------------------
// RaftKv trait
// What the gRPC layer needs from a replica. Uses RPITIT like the storage
// traits; the explicit `+ Send` lets generic servers await across threads.
// ---------------------------------------------------------------------------

pub trait RaftKv: Send + Sync + 'static {
    fn node_id(&self) -> NodeId;

    /// Replicate `commands` as a single entry; resolves once applied locally.
    fn write(&self, commands: Vec<Command>) -> impl Future<Output = Result<LogId, TkvError>> + Send;

    fn get(&self, key: &[u8]) -> impl Future<Output = Result<Option<Vec<u8>>, TkvError>> + Send;

    /// `end` empty means unbounded.
    fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> impl Future<Output = Result<Vec<KvPair>, TkvError>> + Send;

    /// Inbound queue for peer messages.
    fn mailbox(&self) -> Mailbox;
}

impl<S: StateMachineStore> RaftKv for ReplicaHandle<S> {
    fn node_id(&self) -> NodeId {
        self.id()
    }

    async fn write(&self, commands: Vec<Command>) -> Result<LogId, TkvError> {
        ReplicaHandle::write(self, commands).await
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TkvError> {
        ReplicaHandle::get(self, key).await
    }

    async fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>, TkvError> {
        ReplicaHandle::scan(self, start, end, limit).await
    }

    fn mailbox(&self) -> Mailbox {
        ReplicaHandle::mailbox(self)
    }
}
