use std::future::Future;

use tkv_types::{Command, ConfState, Entry, HardState, KvPair, LogId, LogIndex, Term, TkvError};

use crate::types::{LogState, Snapshot};

/// Durable Raft log plus the persisted voting state.
///
/// Methods use RPITIT (`-> impl Future + Send`) so implementations can be
/// plain `async fn`s without an `async-trait` dependency.
///
/// Every mutating call is durable when its future resolves; callers rely on
/// this to acknowledge entries and votes to peers.
pub trait LogStorage: Send + Sync + 'static {
    /// Current extent of the log.
    fn log_state(&self) -> impl Future<Output = Result<LogState, TkvError>> + Send;

    /// Entries in the half-open range `[lo, hi)`. Indices that are purged or
    /// past the end are silently skipped.
    fn entries(&self, lo: LogIndex, hi: LogIndex)
        -> impl Future<Output = Result<Vec<Entry>, TkvError>> + Send;

    /// Term of the entry at `index`.
    ///
    /// Index 0 has term 0. The last purged index still reports its term.
    /// Returns `None` for any other purged index or past the end.
    fn term(&self, index: LogIndex) -> impl Future<Output = Result<Option<Term>, TkvError>> + Send;

    /// Append `entries`, which must be contiguous. Any existing entry at or
    /// after the first new index is discarded first.
    fn append(&self, entries: Vec<Entry>) -> impl Future<Output = Result<(), TkvError>> + Send;

    /// Discard every entry with index `<= index` and record it as the purge
    /// boundary. `index` must still be present in the log.
    fn compact(&self, index: LogIndex) -> impl Future<Output = Result<(), TkvError>> + Send;

    fn hard_state(&self) -> impl Future<Output = Result<HardState, TkvError>> + Send;

    fn save_hard_state(&self, hs: HardState)
        -> impl Future<Output = Result<(), TkvError>> + Send;
}

/// Applied key-value data.
///
/// Only the replica's apply path mutates it; reads may run concurrently.
pub trait StateMachineStore: Send + Sync + 'static {
    /// `LogId` of the last applied entry, `(0, 0)` when nothing was applied.
    fn applied(&self) -> impl Future<Output = Result<LogId, TkvError>> + Send;

    /// Apply the commands of one committed entry together with the new
    /// applied position, atomically. Entries at or below the applied index
    /// are ignored.
    fn apply(&self, entry: LogId, commands: Vec<Command>)
        -> impl Future<Output = Result<(), TkvError>> + Send;

    fn get(&self, key: &[u8]) -> impl Future<Output = Result<Option<Vec<u8>>, TkvError>> + Send;

    /// Pairs with `start <= key < end` in ascending key order, at most `limit`.
    /// An empty `end` is unbounded.
    fn scan(&self, start: &[u8], end: &[u8], limit: usize)
        -> impl Future<Output = Result<Vec<KvPair>, TkvError>> + Send;

    /// Make every applied entry durable. Called before the log is compacted.
    fn flush(&self) -> impl Future<Output = Result<(), TkvError>> + Send;

    /// Capture a consistent image of the data at the current applied index.
    fn build_snapshot(&self, conf_state: ConfState)
        -> impl Future<Output = Result<Snapshot, TkvError>> + Send;

    /// Replace the data with `snapshot` as a single durable step: the data,
    /// the applied index, the log start (entries up to the snapshot are
    /// dropped, or the whole log if it disagrees with the snapshot) and the
    /// persisted commit index all change together or not at all.
    fn install_snapshot(&self, snapshot: Snapshot)
        -> impl Future<Output = Result<(), TkvError>> + Send;
}
