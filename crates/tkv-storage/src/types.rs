use tkv_types::{LogId, LogIndex, SnapshotMeta, TkvError};

pub(crate) fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, TkvError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| TkvError::Storage(e.to_string()))
}

pub(crate) fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, TkvError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| TkvError::Storage(e.to_string()))
}

/// Extent of the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogState {
    /// Last entry discarded by compaction or replaced by a snapshot.
    /// `(0, 0)` when nothing has been purged.
    pub last_purged: LogId,
    /// Last entry in the log, or `last_purged` when no entries remain.
    pub last: LogId,
}

impl LogState {
    pub fn first_index(&self) -> LogIndex {
        self.last_purged.index + 1
    }
}

/// Serialized form stored in [`Snapshot::data`]: every key/value pair of the
/// state machine in ascending key order.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct SnapshotContents {
    pub pairs: Vec<(Vec<u8>, Vec<u8>)>,
}

/// A point-in-time image of the state machine.
///
/// `data` is a `bincode`-serialized [`SnapshotContents`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}
