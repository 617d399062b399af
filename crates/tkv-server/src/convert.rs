use std::collections::HashMap;

use tkv_consensus::{ChunkPayload, SnapshotChunk};
use tkv_proto::v1::{self as pb, snapshot_chunk::Payload};
use tkv_types::{ConfState, KvPair, LogId, NodeId, SnapshotMeta, TkvError};
use tonic::metadata::MetadataValue;
use tonic::Status;

pub const LEADER_ID_HEADER: &str = "tinykv-leader-id";
pub const LEADER_ADDR_HEADER: &str = "tinykv-leader-addr";

pub fn kv_pair_to_proto(pair: KvPair) -> pb::KeyValue {
    pb::KeyValue { key: pair.key, value: pair.value }
}

pub fn header(node_id: NodeId, at: Option<LogId>) -> pb::ResponseHeader {
    let at = at.unwrap_or_default();
    pb::ResponseHeader { node_id, raft_index: at.index, raft_term: at.term }
}

/// Map an error to a gRPC status. `peers` resolves the leader hint to the
/// client address a caller should retry against.
pub fn tkv_to_status(err: TkvError, peers: &HashMap<NodeId, String>) -> Status {
    match &err {
        TkvError::NotLeader { leader } => {
            let mut status = Status::unavailable(err.to_string());
            if let Some(id) = leader {
                status.metadata_mut().insert(LEADER_ID_HEADER, MetadataValue::from(*id));
                if let Some(val) = peers.get(id).and_then(|a| MetadataValue::try_from(a.as_str()).ok()) {
                    status.metadata_mut().insert(LEADER_ADDR_HEADER, val);
                }
            }
            status
        }
        TkvError::ProposalDropped { .. } => Status::aborted(err.to_string()),
        TkvError::Timeout => Status::deadline_exceeded(err.to_string()),
        TkvError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        TkvError::Stopped => Status::unavailable(err.to_string()),
        TkvError::Storage(_) | TkvError::SnapshotTransferFailed(_) => Status::internal(err.to_string()),
    }
}

pub fn chunk_to_proto(chunk: SnapshotChunk) -> pb::SnapshotChunk {
    let payload = match chunk.payload {
        ChunkPayload::Header { meta, total_len, chunk_count } => Payload::Header(pb::SnapshotHeader {
            index: meta.index,
            term: meta.term,
            voters: meta.conf_state.voters,
            total_len,
            chunk_count,
        }),
        ChunkPayload::Data(bytes) => Payload::Data(bytes),
        ChunkPayload::Trailer { checksum } => Payload::Trailer(pb::SnapshotTrailer { checksum }),
    };
    pb::SnapshotChunk {
        from: chunk.from,
        to: chunk.to,
        term: chunk.term,
        transfer_id: chunk.transfer_id,
        seq: chunk.seq,
        payload: Some(payload),
    }
}

pub fn chunk_from_proto(chunk: pb::SnapshotChunk) -> Result<SnapshotChunk, Status> {
    let payload = match chunk.payload {
        Some(Payload::Header(h)) => ChunkPayload::Header {
            meta: SnapshotMeta {
                index: h.index,
                term: h.term,
                conf_state: ConfState { voters: h.voters },
            },
            total_len: h.total_len,
            chunk_count: h.chunk_count,
        },
        Some(Payload::Data(bytes)) => ChunkPayload::Data(bytes),
        Some(Payload::Trailer(t)) => ChunkPayload::Trailer { checksum: t.checksum },
        None => return Err(Status::invalid_argument("snapshot chunk without payload")),
    };
    Ok(SnapshotChunk {
        from: chunk.from,
        to: chunk.to,
        term: chunk.term,
        transfer_id: chunk.transfer_id,
        seq: chunk.seq,
        payload,
    })
}
