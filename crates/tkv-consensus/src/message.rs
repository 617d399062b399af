use tkv_storage::Snapshot;
use tkv_types::{Entry, LogId, LogIndex, NodeId, Term, TkvError};

/// A protocol message with its routing header.
///
/// `term` is the sender's current term; every receiver compares it against
/// its own before looking at the payload.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub term: Term,
    pub message: Message,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>, TkvError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TkvError::InvalidArgument(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TkvError> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(v, _)| v)
            .map_err(|e| TkvError::InvalidArgument(format!("malformed raft message: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Message {
    RequestVote {
        last_log: LogId,
    },
    RequestVoteResponse {
        granted: bool,
    },
    Append {
        /// Entry immediately preceding `entries`, used as the consistency probe.
        prev: LogId,
        entries: Vec<Entry>,
        commit: LogIndex,
    },
    AppendResponse(AppendOutcome),
    Heartbeat {
        /// Leader commit clamped to what the receiver is known to hold.
        commit: LogIndex,
    },
    HeartbeatResponse,
    /// A complete snapshot image received from the leader. Produced locally
    /// once a chunked transfer finishes; never sent as a single message.
    InstallSnapshot {
        snapshot: Snapshot,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestVote { .. } => "request_vote",
            Message::RequestVoteResponse { .. } => "request_vote_response",
            Message::Append { .. } => "append",
            Message::AppendResponse(_) => "append_response",
            Message::Heartbeat { .. } => "heartbeat",
            Message::HeartbeatResponse => "heartbeat_response",
            Message::InstallSnapshot { .. } => "install_snapshot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AppendOutcome {
    /// The receiver's log matches the leader's through `match_index`.
    Accepted { match_index: LogIndex },
    Rejected(Rejection),
}

/// Why an append was refused. Handled entirely between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Rejection {
    /// The sender's term is behind; the envelope carries the current one.
    StaleTerm,
    /// The consistency probe at `rejected` failed.
    LogConflict {
        rejected: LogIndex,
        /// Receiver's term at `rejected`, `None` when its log is shorter.
        conflict_term: Option<Term>,
        /// First index of `conflict_term` in the receiver's log, or its last
        /// index + 1 when the log is shorter.
        hint: LogIndex,
    },
}
