use std::sync::Arc;

use tkv_consensus::{Envelope, Message, RaftKv, SnapshotReceiver};
use tkv_proto::v1::{raft_service_server::RaftService, Done, RaftMessage, SnapshotChunk};
use tkv_types::TkvError;
use tonic::{Request, Response, Status, Streaming};

use crate::convert::chunk_from_proto;

pub struct RaftServiceImpl<R> {
    raft: Arc<R>,
}

impl<R: RaftKv> RaftServiceImpl<R> {
    pub fn new(raft: Arc<R>) -> Self {
        RaftServiceImpl { raft }
    }
}

fn delivery_status(err: TkvError) -> Status {
    match err {
        TkvError::Stopped => Status::unavailable("replica stopped"),
        TkvError::InvalidArgument(m) => Status::invalid_argument(m),
        e => Status::internal(e.to_string()),
    }
}

#[tonic::async_trait]
impl<R: RaftKv> RaftService for RaftServiceImpl<R> {
    async fn raft(&self, request: Request<RaftMessage>) -> Result<Response<Done>, Status> {
        let env = Envelope::decode(&request.into_inner().data).map_err(delivery_status)?;
        if matches!(env.message, Message::InstallSnapshot { .. }) {
            return Err(Status::invalid_argument("snapshots must use the Snapshot stream"));
        }
        self.raft.mailbox().deliver(env).map_err(delivery_status)?;
        Ok(Response::new(Done {}))
    }

    async fn snapshot(
        &self,
        request: Request<Streaming<SnapshotChunk>>,
    ) -> Result<Response<Done>, Status> {
        let mut stream = request.into_inner();
        // Dropped with this call, so a broken stream leaves nothing behind.
        let mut receiver = SnapshotReceiver::new();
        while let Some(chunk) = stream.message().await? {
            let chunk = chunk_from_proto(chunk)?;
            let complete = receiver
                .receive(chunk)
                .map_err(|e| Status::failed_precondition(e.to_string()))?;
            if let Some(env) = complete {
                tracing::debug!(node_id = self.raft.node_id(), from = env.from, "snapshot stream complete");
                self.raft.mailbox().deliver_snapshot(env).await.map_err(delivery_status)?;
                return Ok(Response::new(Done {}));
            }
        }
        Err(Status::aborted("snapshot stream ended before trailer"))
    }
}
