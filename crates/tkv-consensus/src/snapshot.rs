use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::AbortHandle;

use tkv_storage::{Snapshot, StateMachineStore};
use tkv_types::{ConfState, LogIndex, NodeId, SnapshotMeta, Term, TkvError};

use crate::message::{Envelope, Message};
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// Wire framing
//
// A transfer is: one header (seq 0), `chunk_count` data chunks (seq 1..),
// one trailer carrying the CRC32 of the whole image. Every chunk repeats
// the routing header and the transfer id so the receiver can reject
// interleaved or restarted streams.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChunk {
    pub from: NodeId,
    pub to: NodeId,
    pub term: Term,
    pub transfer_id: String,
    pub seq: u64,
    pub payload: ChunkPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPayload {
    Header { meta: SnapshotMeta, total_len: u64, chunk_count: u64 },
    Data(Vec<u8>),
    Trailer { checksum: u32 },
}

/// Cut `snapshot` into a framed chunk stream.
pub fn split(
    from: NodeId,
    to: NodeId,
    term: Term,
    snapshot: &Snapshot,
    chunk_size: usize,
) -> Vec<SnapshotChunk> {
    let transfer_id = uuid::Uuid::new_v4().to_string();
    let pieces: Vec<&[u8]> = snapshot.data.chunks(chunk_size.max(1)).collect();
    let chunk = |seq: u64, payload: ChunkPayload| SnapshotChunk {
        from,
        to,
        term,
        transfer_id: transfer_id.clone(),
        seq,
        payload,
    };

    let mut out = Vec::with_capacity(pieces.len() + 2);
    out.push(chunk(
        0,
        ChunkPayload::Header {
            meta: snapshot.meta.clone(),
            total_len: snapshot.data.len() as u64,
            chunk_count: pieces.len() as u64,
        },
    ));
    for (i, piece) in pieces.iter().enumerate() {
        out.push(chunk(i as u64 + 1, ChunkPayload::Data(piece.to_vec())));
    }
    out.push(chunk(
        pieces.len() as u64 + 1,
        ChunkPayload::Trailer { checksum: crc32fast::hash(&snapshot.data) },
    ));
    out
}

// ---------------------------------------------------------------------------
// SnapshotReceiver
// ---------------------------------------------------------------------------

struct Staging {
    from: NodeId,
    to: NodeId,
    term: Term,
    transfer_id: String,
    meta: SnapshotMeta,
    total_len: u64,
    chunk_count: u64,
    next_seq: u64,
    buf: Vec<u8>,
    hasher: crc32fast::Hasher,
}

/// Reassembles one chunk stream into an `InstallSnapshot` envelope.
///
/// Nothing leaves the receiver until the trailer checks out, so a stream
/// that breaks off or fails validation leaves the replica untouched.
/// Transfers are not resumable; any error discards the staging buffer and
/// the sender starts over.
#[derive(Default)]
pub struct SnapshotReceiver {
    staging: Option<Staging>,
}

impl SnapshotReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.staging.is_some()
    }

    /// Returns the envelope once the final chunk is accepted.
    pub fn receive(&mut self, chunk: SnapshotChunk) -> Result<Option<Envelope>, TkvError> {
        let result = self.accept(chunk);
        if result.is_err() {
            self.staging = None;
        }
        result
    }

    fn accept(&mut self, chunk: SnapshotChunk) -> Result<Option<Envelope>, TkvError> {
        if let ChunkPayload::Header { meta, total_len, chunk_count } = chunk.payload {
            if chunk.seq != 0 {
                return Err(failed(format!("header with sequence {}", chunk.seq)));
            }
            self.staging = Some(Staging {
                from: chunk.from,
                to: chunk.to,
                term: chunk.term,
                transfer_id: chunk.transfer_id,
                meta,
                total_len,
                chunk_count,
                next_seq: 1,
                buf: Vec::with_capacity(total_len.min(64 << 20) as usize),
                hasher: crc32fast::Hasher::new(),
            });
            return Ok(None);
        }

        let staging = self
            .staging
            .as_mut()
            .ok_or_else(|| failed("chunk received before header".into()))?;
        if chunk.transfer_id != staging.transfer_id {
            return Err(failed(format!(
                "chunk from transfer {} while receiving {}",
                chunk.transfer_id, staging.transfer_id
            )));
        }
        if chunk.seq != staging.next_seq {
            return Err(failed(format!("expected chunk {}, got {}", staging.next_seq, chunk.seq)));
        }
        staging.next_seq += 1;

        match chunk.payload {
            ChunkPayload::Data(bytes) => {
                if chunk.seq > staging.chunk_count {
                    return Err(failed(format!("more than {} data chunks", staging.chunk_count)));
                }
                staging.hasher.update(&bytes);
                staging.buf.extend_from_slice(&bytes);
                if staging.buf.len() as u64 > staging.total_len {
                    return Err(failed(format!("snapshot larger than announced {}", staging.total_len)));
                }
                Ok(None)
            }
            ChunkPayload::Trailer { checksum } => {
                let Some(staging) = self.staging.take() else {
                    return Err(failed("trailer without a transfer".into()));
                };
                if staging.buf.len() as u64 != staging.total_len || chunk.seq != staging.chunk_count + 1 {
                    return Err(failed(format!(
                        "truncated snapshot: {} of {} bytes",
                        staging.buf.len(),
                        staging.total_len
                    )));
                }
                let actual = staging.hasher.finalize();
                if actual != checksum {
                    return Err(failed(format!("checksum mismatch: {actual:#010x} != {checksum:#010x}")));
                }
                Ok(Some(Envelope {
                    from: staging.from,
                    to: staging.to,
                    term: staging.term,
                    message: Message::InstallSnapshot {
                        snapshot: Snapshot { meta: staging.meta, data: staging.buf },
                    },
                }))
            }
            ChunkPayload::Header { .. } => Err(failed("unexpected header".into())),
        }
    }
}

fn failed(reason: String) -> TkvError {
    TkvError::SnapshotTransferFailed(reason)
}

// ---------------------------------------------------------------------------
// SnapshotManager
// ---------------------------------------------------------------------------

/// Leader-side bookkeeping for outbound transfers: at most one per peer,
/// each in its own task so the driver never blocks on a slow follower.
pub struct SnapshotManager {
    chunk_size: usize,
    /// Running transfer per peer, tagged with the term that started it.
    in_flight: HashMap<NodeId, (Term, AbortHandle)>,
}

impl SnapshotManager {
    pub fn new(chunk_size: usize) -> Self {
        SnapshotManager { chunk_size, in_flight: HashMap::new() }
    }

    pub fn is_sending(&self, peer: NodeId) -> bool {
        self.in_flight.get(&peer).is_some_and(|(_, h)| !h.is_finished())
    }

    /// Build a snapshot of `sm` and stream it to `to`. `done` runs with the
    /// snapshot index once the receiver has acknowledged the stream.
    #[allow(clippy::too_many_arguments)]
    pub fn generate<S, T, F>(
        &mut self,
        from: NodeId,
        to: NodeId,
        term: Term,
        conf_state: ConfState,
        sm: Arc<S>,
        transport: Arc<T>,
        done: F,
    ) where
        S: StateMachineStore,
        T: Transport,
        F: FnOnce(Result<LogIndex, TkvError>) + Send + 'static,
    {
        if self.is_sending(to) {
            return;
        }
        let chunk_size = self.chunk_size;
        let task = tokio::spawn(async move {
            let result = async {
                let snapshot = sm.build_snapshot(conf_state).await?;
                let index = snapshot.meta.index;
                let chunks = split(from, to, term, &snapshot, chunk_size);
                tracing::info!(
                    node_id = from,
                    peer = to,
                    index,
                    bytes = snapshot.data.len(),
                    chunks = chunks.len(),
                    "sending snapshot"
                );
                transport.send_snapshot(to, chunks).await?;
                Ok(index)
            }
            .await;
            if let Err(e) = &result {
                tracing::warn!(node_id = from, peer = to, error = %e, "snapshot transfer failed");
            }
            done(result);
        });
        self.in_flight.insert(to, (term, task.abort_handle()));
    }

    /// Forget the transfer to `peer` started in `term`. A late outcome from
    /// an older term leaves a newer transfer in place.
    pub fn finish(&mut self, peer: NodeId, term: Term) {
        if self.in_flight.get(&peer).is_some_and(|(started, _)| *started == term) {
            self.in_flight.remove(&peer);
        }
    }

    /// Abort every outbound transfer, e.g. after losing leadership.
    pub fn cancel_all(&mut self) {
        for (peer, (_, handle)) in self.in_flight.drain() {
            if !handle.is_finished() {
                tracing::debug!(peer, "aborting snapshot transfer");
            }
            handle.abort();
        }
    }
}

impl Drop for SnapshotManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(len: usize) -> Snapshot {
        Snapshot {
            meta: SnapshotMeta { index: 42, term: 3, conf_state: ConfState { voters: vec![1, 2, 3] } },
            data: (0..len).map(|i| (i % 251) as u8).collect(),
        }
    }

    fn deliver(rx: &mut SnapshotReceiver, chunks: Vec<SnapshotChunk>) -> Result<Option<Envelope>, TkvError> {
        let mut out = None;
        for c in chunks {
            out = rx.receive(c)?;
        }
        Ok(out)
    }

    #[test]
    fn full_transfer_reassembles_snapshot() {
        let snap = image(1000);
        let chunks = split(1, 2, 3, &snap, 128);
        assert_eq!(chunks.len(), 8 + 2);

        let mut rx = SnapshotReceiver::new();
        let env = deliver(&mut rx, chunks).unwrap().expect("complete");
        assert_eq!((env.from, env.to, env.term), (1, 2, 3));
        assert_eq!(env.message, Message::InstallSnapshot { snapshot: snap });
        assert!(!rx.in_progress());
    }

    #[test]
    fn empty_snapshot_has_no_data_chunks() {
        let snap = image(0);
        let chunks = split(1, 2, 3, &snap, 128);
        assert_eq!(chunks.len(), 2);
        let env = deliver(&mut SnapshotReceiver::new(), chunks).unwrap().expect("complete");
        assert_eq!(env.message, Message::InstallSnapshot { snapshot: snap });
    }

    #[test]
    fn interrupted_stream_yields_nothing() {
        let mut chunks = split(1, 2, 3, &image(1000), 100);
        chunks.truncate(5);
        let mut rx = SnapshotReceiver::new();
        assert!(deliver(&mut rx, chunks).unwrap().is_none());
        assert!(rx.in_progress());
    }

    #[test]
    fn corrupted_chunk_fails_checksum() {
        let mut chunks = split(1, 2, 3, &image(300), 100);
        if let ChunkPayload::Data(bytes) = &mut chunks[2].payload {
            bytes[0] ^= 0xff;
        }
        let mut rx = SnapshotReceiver::new();
        let err = deliver(&mut rx, chunks).unwrap_err();
        assert!(matches!(err, TkvError::SnapshotTransferFailed(m) if m.contains("checksum")));
        assert!(!rx.in_progress());
    }

    #[test]
    fn out_of_order_chunk_aborts_transfer() {
        let mut chunks = split(1, 2, 3, &image(300), 100);
        chunks.swap(1, 2);
        let err = deliver(&mut SnapshotReceiver::new(), chunks).unwrap_err();
        assert!(matches!(err, TkvError::SnapshotTransferFailed(_)));
    }

    #[test]
    fn missing_data_chunk_is_truncation() {
        let mut chunks = split(1, 2, 3, &image(300), 100);
        chunks.remove(3);
        // The trailer now arrives where the last data chunk was expected.
        let err = deliver(&mut SnapshotReceiver::new(), chunks).unwrap_err();
        assert!(matches!(err, TkvError::SnapshotTransferFailed(_)));
    }

    #[test]
    fn new_header_restarts_staging() {
        let first = split(1, 2, 3, &image(300), 100);
        let second = split(1, 2, 4, &image(200), 100);
        let mut rx = SnapshotReceiver::new();
        rx.receive(first[0].clone()).unwrap();
        rx.receive(first[1].clone()).unwrap();

        let env = deliver(&mut rx, second).unwrap().expect("complete");
        assert_eq!(env.term, 4);
        assert!(matches!(env.message, Message::InstallSnapshot { snapshot } if snapshot.data.len() == 200));
    }

    #[test]
    fn chunk_from_other_transfer_is_rejected() {
        let first = split(1, 2, 3, &image(300), 100);
        let second = split(1, 2, 3, &image(300), 100);
        let mut rx = SnapshotReceiver::new();
        rx.receive(first[0].clone()).unwrap();
        assert!(rx.receive(second[1].clone()).is_err());
    }

    struct Stalled;

    impl Transport for Stalled {
        fn send(&self, _env: Envelope) {}

        async fn send_snapshot(&self, _to: NodeId, _chunks: Vec<SnapshotChunk>) -> Result<(), TkvError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn late_outcome_from_older_term_keeps_current_transfer() {
        use tkv_storage::mem::{MemStateMachine, MemStore};

        let sm = Arc::new(MemStateMachine::new(MemStore::new()));
        let mut manager = SnapshotManager::new(64);
        manager.generate(1, 2, 5, ConfState::default(), sm.clone(), Arc::new(Stalled), |_| {});
        assert!(manager.is_sending(2));

        manager.finish(2, 4);
        assert!(manager.is_sending(2));

        manager.finish(2, 5);
        assert!(!manager.is_sending(2));
        manager.generate(1, 2, 5, ConfState::default(), sm, Arc::new(Stalled), |_| {});
        assert!(manager.is_sending(2));
        manager.cancel_all();
        assert!(!manager.is_sending(2));
    }
}
