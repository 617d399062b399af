use tkv_types::{LogIndex, TkvError};

/// `raft_log` keyspace: `index(8)` big-endian, so lexicographic order is
/// numeric order.
pub fn log_key(index: LogIndex) -> [u8; 8] {
    index.to_be_bytes()
}

/// Inverse of [`log_key`].
pub fn log_index(key: &[u8]) -> Result<LogIndex, TkvError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| TkvError::Storage(format!("malformed raft_log key of {} bytes", key.len())))?;
    Ok(LogIndex::from_be_bytes(bytes))
}

/// `meta` keyspace labels.
pub const HARD_STATE: &[u8] = b"hard_state";
/// `LogId` of the last entry dropped by compaction or snapshot install.
pub const LAST_PURGED: &[u8] = b"last_purged";
/// `LogId` of the last entry applied to the `data` keyspace.
pub const APPLIED: &[u8] = b"applied";
