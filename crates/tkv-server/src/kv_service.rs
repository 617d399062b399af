use std::collections::HashMap;
use std::sync::Arc;

use tkv_consensus::RaftKv;
use tkv_proto::v1::{
    tiny_kv_server::TinyKv, RawDeleteRequest, RawDeleteResponse, RawGetRequest, RawGetResponse,
    RawPutRequest, RawPutResponse, RawScanRequest, RawScanResponse,
};
use tkv_types::{Command, NodeId, TkvError};
use tonic::{Request, Response, Status};

use crate::convert::{header, kv_pair_to_proto, tkv_to_status};

/// Scan paging bounds applied to `RawScan`.
#[derive(Debug, Clone, Copy)]
pub struct ScanLimits {
    /// Used when the request asks for 0.
    pub default: usize,
    pub max: usize,
}

impl Default for ScanLimits {
    fn default() -> Self {
        ScanLimits { default: 100, max: 10_000 }
    }
}

pub struct KvServiceImpl<R> {
    raft: Arc<R>,
    /// Client addresses by node, for leader redirects.
    peers: Arc<HashMap<NodeId, String>>,
    limits: ScanLimits,
}

impl<R: RaftKv> KvServiceImpl<R> {
    pub fn new(raft: Arc<R>, peers: Arc<HashMap<NodeId, String>>, limits: ScanLimits) -> Self {
        KvServiceImpl { raft, peers, limits }
    }

    fn status(&self, err: TkvError) -> Status {
        tkv_to_status(err, &self.peers)
    }
}

fn require_key(key: &[u8]) -> Result<(), Status> {
    if key.is_empty() {
        return Err(Status::invalid_argument("key must not be empty"));
    }
    Ok(())
}

#[tonic::async_trait]
impl<R: RaftKv> TinyKv for KvServiceImpl<R> {
    async fn raw_get(
        &self,
        request: Request<RawGetRequest>,
    ) -> Result<Response<RawGetResponse>, Status> {
        let req = request.into_inner();
        require_key(&req.key)?;
        let value = self.raft.get(&req.key).await.map_err(|e| self.status(e))?;
        Ok(Response::new(RawGetResponse {
            header: Some(header(self.raft.node_id(), None)),
            not_found: value.is_none(),
            value: value.unwrap_or_default(),
        }))
    }

    async fn raw_put(
        &self,
        request: Request<RawPutRequest>,
    ) -> Result<Response<RawPutResponse>, Status> {
        let req = request.into_inner();
        require_key(&req.key)?;
        let at = self
            .raft
            .write(vec![Command::Put { key: req.key, value: req.value }])
            .await
            .map_err(|e| self.status(e))?;
        Ok(Response::new(RawPutResponse { header: Some(header(self.raft.node_id(), Some(at))) }))
    }

    async fn raw_delete(
        &self,
        request: Request<RawDeleteRequest>,
    ) -> Result<Response<RawDeleteResponse>, Status> {
        let req = request.into_inner();
        require_key(&req.key)?;
        let at = self
            .raft
            .write(vec![Command::Delete { key: req.key }])
            .await
            .map_err(|e| self.status(e))?;
        Ok(Response::new(RawDeleteResponse { header: Some(header(self.raft.node_id(), Some(at))) }))
    }

    async fn raw_scan(
        &self,
        request: Request<RawScanRequest>,
    ) -> Result<Response<RawScanResponse>, Status> {
        let req = request.into_inner();
        let limit = match req.limit as usize {
            0 => self.limits.default,
            n => n.min(self.limits.max),
        };
        let pairs = self
            .raft
            .scan(&req.start_key, &req.end_key, limit)
            .await
            .map_err(|e| self.status(e))?;
        Ok(Response::new(RawScanResponse {
            header: Some(header(self.raft.node_id(), None)),
            kvs: pairs.into_iter().map(kv_pair_to_proto).collect(),
        }))
    }
}
