use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use fjall::Readable;
use parking_lot::Mutex;
use tkv_types::{
    Command, ConfState, Entry, HardState, KvPair, LogId, LogIndex, SnapshotMeta, Term, TkvError,
};

use crate::keys::{log_index, log_key, APPLIED, HARD_STATE, LAST_PURGED};
use crate::traits::{LogStorage, StateMachineStore};
use crate::types::{decode, encode, LogState, Snapshot, SnapshotContents};

fn fjall_err(e: fjall::Error) -> TkvError {
    TkvError::Storage(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> TkvError {
    TkvError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// FjallStore: shared handle wrapping all keyspaces
// ---------------------------------------------------------------------------

/// Shared storage handle.
///
/// All keyspaces live in a single fjall `Database` so that cross-keyspace
/// write batches are atomic. Snapshot install relies on this to swap the
/// data, the applied index and the log start in one commit.
pub struct FjallStore {
    /// The underlying fjall database.
    pub db: fjall::Database,
    /// Raft log entries: `index(8)` → bincode(Entry)
    pub raft_log: fjall::Keyspace,
    /// Applied key-value data: `user_key` → `value`
    pub data: fjall::Keyspace,
    /// Metadata: label → bincode(value), see [`crate::keys`].
    pub meta: fjall::Keyspace,
    /// Serializes apply and install, which both read `APPLIED` before
    /// committing. Snapshot builds read through a database snapshot instead.
    write_gate: Mutex<()>,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, TkvError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let raft_log =
            db.keyspace("raft_log", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let data =
            db.keyspace("data", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let meta =
            db.keyspace("meta", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(Arc::new(FjallStore { db, raft_log, data, meta, write_gate: Mutex::new(()) }))
    }

    fn sync(&self) -> Result<(), TkvError> {
        self.db.persist(fjall::PersistMode::SyncAll).map_err(fjall_err)
    }

    fn read_meta<T: for<'de> serde::Deserialize<'de>>(
        &self,
        label: &[u8],
    ) -> Result<Option<T>, TkvError> {
        match self.meta.get(label).map_err(fjall_err)? {
            Some(b) => Ok(Some(decode::<T>(&b)?)),
            None => Ok(None),
        }
    }

    fn last_purged(&self) -> Result<LogId, TkvError> {
        Ok(self.read_meta::<LogId>(LAST_PURGED)?.unwrap_or_default())
    }

    fn term_of(&self, index: LogIndex) -> Result<Option<Term>, TkvError> {
        if index == 0 {
            return Ok(Some(0));
        }
        if let Some(b) = self.raft_log.get(log_key(index)).map_err(fjall_err)? {
            return Ok(Some(decode::<Entry>(&b)?.term));
        }
        let purged = self.last_purged()?;
        Ok((purged.index == index).then_some(purged.term))
    }

    /// Keys of every log entry with index `>= from`.
    fn log_keys_from(&self, from: LogIndex) -> Result<Vec<Vec<u8>>, TkvError> {
        self.raft_log
            .range(log_key(from).to_vec()..)
            .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
            .collect()
    }

    /// Keys of every log entry with index `<= to`.
    fn log_keys_through(&self, to: LogIndex) -> Result<Vec<Vec<u8>>, TkvError> {
        self.raft_log
            .range(log_key(0).to_vec()..=log_key(to).to_vec())
            .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// FjallLogStorage
// ---------------------------------------------------------------------------

/// `LogStorage` backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`. Mutations
/// are followed by a `SyncAll` persist so they survive a crash.
pub struct FjallLogStorage(pub Arc<FjallStore>);

impl LogStorage for FjallLogStorage {
    async fn log_state(&self) -> Result<LogState, TkvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<LogState, TkvError> {
            let last_purged = store.last_purged()?;
            let last = match store.raft_log.iter().last() {
                Some(guard) => {
                    let (k, v) = guard.into_inner().map_err(fjall_err)?;
                    let entry = decode::<Entry>(&v)?;
                    if log_index(&k)? != entry.index {
                        return Err(TkvError::Storage(format!(
                            "raft_log key does not match entry index {}",
                            entry.index
                        )));
                    }
                    entry.log_id()
                }
                None => last_purged,
            };
            Ok(LogState { last_purged, last })
        })
        .await
        .map_err(join_err)?
    }

    async fn entries(&self, lo: LogIndex, hi: LogIndex) -> Result<Vec<Entry>, TkvError> {
        if lo >= hi {
            return Ok(Vec::new());
        }
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Entry>, TkvError> {
            store
                .raft_log
                .range(log_key(lo).to_vec()..log_key(hi).to_vec())
                .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<Entry>(&v)))
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn term(&self, index: LogIndex) -> Result<Option<Term>, TkvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || store.term_of(index)).await.map_err(join_err)?
    }

    async fn append(&self, entries: Vec<Entry>) -> Result<(), TkvError> {
        let Some(last) = entries.last().map(|e| e.index) else {
            return Ok(());
        };
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), TkvError> {
            // Entries inside the new range are overwritten in place; anything
            // past it belongs to the discarded suffix.
            let stale = store.log_keys_from(last + 1)?;
            let mut batch = store.db.batch();
            for k in stale {
                batch.remove(&store.raft_log, k);
            }
            for entry in &entries {
                batch.insert(&store.raft_log, log_key(entry.index).to_vec(), encode(entry)?);
            }
            batch.commit().map_err(fjall_err)?;
            store.sync()
        })
        .await
        .map_err(join_err)?
    }

    async fn compact(&self, index: LogIndex) -> Result<(), TkvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), TkvError> {
            if index <= store.last_purged()?.index {
                return Ok(());
            }
            let term = store.term_of(index)?.ok_or_else(|| {
                TkvError::Storage(format!("cannot compact through missing index {index}"))
            })?;
            let keys = store.log_keys_through(index)?;
            let mut batch = store.db.batch();
            for k in keys {
                batch.remove(&store.raft_log, k);
            }
            batch.insert(&store.meta, LAST_PURGED, encode(&LogId::new(term, index))?);
            batch.commit().map_err(fjall_err)?;
            store.sync()?;
            tracing::debug!(index, term, "compacted raft log");
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn hard_state(&self) -> Result<HardState, TkvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<HardState, TkvError> {
            Ok(store.read_meta::<HardState>(HARD_STATE)?.unwrap_or_default())
        })
        .await
        .map_err(join_err)?
    }

    async fn save_hard_state(&self, hs: HardState) -> Result<(), TkvError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), TkvError> {
            store.meta.insert(HARD_STATE, encode(&hs)?).map_err(fjall_err)?;
            store.sync()
        })
        .await
        .map_err(join_err)?
    }
}

// ---------------------------------------------------------------------------
// FjallStateMachine
// ---------------------------------------------------------------------------

/// `StateMachineStore` backed by fjall.
///
/// Applied batches are not synced individually; [`StateMachineStore::flush`]
/// is called before the log is compacted, and the log retains everything
/// past the last flush.
pub struct FjallStateMachine {
    pub store: Arc<FjallStore>,
}

impl FjallStateMachine {
    pub fn new(store: Arc<FjallStore>) -> Self {
        FjallStateMachine { store }
    }
}

impl StateMachineStore for FjallStateMachine {
    async fn applied(&self) -> Result<LogId, TkvError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<LogId, TkvError> {
            Ok(store.read_meta::<LogId>(APPLIED)?.unwrap_or_default())
        })
        .await
        .map_err(join_err)?
    }

    async fn apply(&self, entry: LogId, commands: Vec<Command>) -> Result<(), TkvError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<(), TkvError> {
            let _gate = store.write_gate.lock();
            let applied = store.read_meta::<LogId>(APPLIED)?.unwrap_or_default();
            if entry.index <= applied.index {
                tracing::debug!(index = entry.index, applied = applied.index, "skipping applied entry");
                return Ok(());
            }

            // Last write per key wins within one batch.
            let mut writes: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
            for cmd in commands {
                match cmd {
                    Command::Put { key, value } => writes.insert(key, Some(value)),
                    Command::Delete { key } => writes.insert(key, None),
                };
            }

            let mut batch = store.db.batch();
            for (key, value) in writes {
                match value {
                    Some(v) => {
                        batch.insert(&store.data, key, v);
                    }
                    None => {
                        batch.remove(&store.data, key);
                    }
                }
            }
            batch.insert(&store.meta, APPLIED, encode(&entry)?);
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TkvError> {
        let store = self.store.clone();
        let key = key.to_vec();
        tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>, TkvError> {
            Ok(store.data.get(key).map_err(fjall_err)?.map(|v| v.to_vec()))
        })
        .await
        .map_err(join_err)?
    }

    async fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>, TkvError> {
        if limit == 0 || (!end.is_empty() && start >= end) {
            return Ok(Vec::new());
        }
        let store = self.store.clone();
        let start = start.to_vec();
        let end = end.to_vec();
        tokio::task::spawn_blocking(move || -> Result<Vec<KvPair>, TkvError> {
            let mut pairs = Vec::new();
            if end.is_empty() {
                for guard in store.data.range(start..).take(limit) {
                    let (k, v) = guard.into_inner().map_err(fjall_err)?;
                    pairs.push(KvPair { key: k.to_vec(), value: v.to_vec() });
                }
            } else {
                for guard in store.data.range(start..end).take(limit) {
                    let (k, v) = guard.into_inner().map_err(fjall_err)?;
                    pairs.push(KvPair { key: k.to_vec(), value: v.to_vec() });
                }
            }
            Ok(pairs)
        })
        .await
        .map_err(join_err)?
    }

    async fn flush(&self) -> Result<(), TkvError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.sync()).await.map_err(join_err)?
    }

    async fn build_snapshot(&self, conf_state: ConfState) -> Result<Snapshot, TkvError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<Snapshot, TkvError> {
            // One point-in-time view over both keyspaces; apply keeps running.
            let view = store.db.snapshot();
            let applied = match view.get(&store.meta, APPLIED).map_err(fjall_err)? {
                Some(b) => decode::<LogId>(&b)?,
                None => LogId::default(),
            };
            let pairs: Vec<(Vec<u8>, Vec<u8>)> = view
                .iter(&store.data)
                .map(|g| g.into_inner().map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(fjall_err))
                .collect::<Result<_, _>>()?;
            Ok(Snapshot {
                meta: SnapshotMeta { index: applied.index, term: applied.term, conf_state },
                data: encode(&SnapshotContents { pairs })?,
            })
        })
        .await
        .map_err(join_err)?
    }

    async fn install_snapshot(&self, snapshot: Snapshot) -> Result<(), TkvError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<(), TkvError> {
            // Decode before touching anything so a bad image leaves state intact.
            let contents: SnapshotContents = decode(&snapshot.data)?;
            let boundary = snapshot.meta.log_id();

            let _gate = store.write_gate.lock();

            let incoming: BTreeSet<&[u8]> = contents.pairs.iter().map(|(k, _)| k.as_slice()).collect();
            let stale_data: Vec<Vec<u8>> = store
                .data
                .iter()
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .filter(|r| r.as_ref().map(|k| !incoming.contains(k.as_slice())).unwrap_or(true))
                .collect::<Result<_, _>>()?;

            let keep_tail = store.term_of(boundary.index)? == Some(boundary.term);
            let stale_log = if keep_tail {
                store.log_keys_through(boundary.index)?
            } else {
                store.log_keys_from(0)?
            };

            let mut hs = store.read_meta::<HardState>(HARD_STATE)?.unwrap_or_default();
            hs.commit = hs.commit.max(boundary.index);

            let mut batch = store.db.batch();
            for k in stale_data {
                batch.remove(&store.data, k);
            }
            for (k, v) in &contents.pairs {
                batch.insert(&store.data, k.as_slice(), v.as_slice());
            }
            for k in stale_log {
                batch.remove(&store.raft_log, k);
            }
            batch.insert(&store.meta, LAST_PURGED, encode(&boundary)?);
            batch.insert(&store.meta, APPLIED, encode(&boundary)?);
            batch.insert(&store.meta, HARD_STATE, encode(&hs)?);
            batch.commit().map_err(fjall_err)?;
            store.sync()?;

            tracing::info!(
                index = boundary.index,
                term = boundary.term,
                keys = contents.pairs.len(),
                kept_log_tail = keep_tail,
                "installed snapshot"
            );
            Ok(())
        })
        .await
        .map_err(join_err)?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
