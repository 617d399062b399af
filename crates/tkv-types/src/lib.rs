pub type NodeId = u64;
pub type Term = u64;
pub type LogIndex = u64;

/// Position of an entry in the replicated log.
///
/// Ordering is lexicographic on `(term, index)`, which is exactly the
/// "at least as up to date" comparison used when granting votes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct LogId {
    pub term: Term,
    pub index: LogIndex,
}

impl LogId {
    pub fn new(term: Term, index: LogIndex) -> Self {
        LogId { term, index }
    }
}

impl PartialOrd for LogId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.term, self.index).cmp(&(other.term, other.index))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EntryKind {
    Normal,
    /// Reserved for membership changes; applied as a no-op.
    ConfChange,
}

/// One slot of the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Entry {
    pub index: LogIndex,
    pub term: Term,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

impl Entry {
    pub fn normal(index: LogIndex, term: Term, payload: Vec<u8>) -> Self {
        Entry { index, term, kind: EntryKind::Normal, payload }
    }

    /// The empty entry a leader appends when it takes office.
    pub fn noop(index: LogIndex, term: Term) -> Self {
        Entry::normal(index, term, Vec::new())
    }

    pub fn log_id(&self) -> LogId {
        LogId::new(self.term, self.index)
    }

    pub fn is_noop(&self) -> bool {
        self.kind == EntryKind::Normal && self.payload.is_empty()
    }
}

/// Durable voting state. Must hit disk before any response that depends on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub commit: LogIndex,
}

/// Voting membership of the group, supplied externally.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConfState {
    pub voters: Vec<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotMeta {
    pub index: LogIndex,
    pub term: Term,
    pub conf_state: ConfState,
}

impl SnapshotMeta {
    pub fn log_id(&self) -> LogId {
        LogId::new(self.term, self.index)
    }
}

/// Mutations carried by log entries. Reads are never logged.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Command {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl Command {
    pub fn key(&self) -> &[u8] {
        match self {
            Command::Put { key, .. } | Command::Delete { key } => key,
        }
    }

    /// Encode a batch of commands as one entry payload.
    pub fn encode_batch(commands: &[Command]) -> Result<Vec<u8>, TkvError> {
        bincode::serde::encode_to_vec(commands, bincode::config::standard())
            .map_err(|e| TkvError::InvalidArgument(e.to_string()))
    }

    /// Decode an entry payload. An empty payload is a no-op batch.
    pub fn decode_batch(payload: &[u8]) -> Result<Vec<Command>, TkvError> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        bincode::serde::decode_from_slice(payload, bincode::config::standard())
            .map(|(v, _)| v)
            .map_err(|e| TkvError::Storage(format!("corrupt entry payload: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KvPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TkvError {
    #[error("not the leader; hint: {leader:?}")]
    NotLeader { leader: Option<NodeId> },
    #[error("proposal at index {index} was superseded before commit")]
    ProposalDropped { index: LogIndex },
    #[error("snapshot transfer failed: {0}")]
    SnapshotTransferFailed(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("operation timed out")]
    Timeout,
    #[error("replica stopped")]
    Stopped,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl TkvError {
    /// Whether a client may retry the operation without side effects.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TkvError::NotLeader { .. }
                | TkvError::ProposalDropped { .. }
                | TkvError::Timeout
                | TkvError::SnapshotTransferFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_id_orders_by_term_first() {
        assert!(LogId::new(2, 1) > LogId::new(1, 100));
        assert!(LogId::new(2, 5) > LogId::new(2, 4));
        assert_eq!(LogId::new(3, 3).cmp(&LogId::new(3, 3)), std::cmp::Ordering::Equal);
    }

    #[test]
    fn empty_payload_decodes_to_no_commands() {
        assert!(Command::decode_batch(&[]).unwrap().is_empty());
        assert!(Entry::noop(4, 2).is_noop());
    }

    #[test]
    fn batch_preserves_command_order() {
        let batch = vec![
            Command::Put { key: b"a".to_vec(), value: b"1".to_vec() },
            Command::Delete { key: b"a".to_vec() },
        ];
        let payload = Command::encode_batch(&batch).unwrap();
        assert_eq!(Command::decode_batch(&payload).unwrap(), batch);
    }

    #[test]
    fn retryable_errors() {
        assert!(TkvError::NotLeader { leader: Some(2) }.is_retryable());
        assert!(TkvError::ProposalDropped { index: 9 }.is_retryable());
        assert!(!TkvError::Storage("disk".into()).is_retryable());
        assert!(!TkvError::Stopped.is_retryable());
    }
}
