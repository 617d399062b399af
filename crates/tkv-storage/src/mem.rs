use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use tkv_types::{
    Command, ConfState, Entry, HardState, KvPair, LogId, LogIndex, SnapshotMeta, Term, TkvError,
};

use crate::traits::{LogStorage, StateMachineStore};
use crate::types::{decode, encode, LogState, Snapshot, SnapshotContents};

struct MemLog {
    entries: BTreeMap<LogIndex, Entry>,
    last_purged: LogId,
    hard_state: HardState,
}

impl MemLog {
    fn term_of(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        match self.entries.get(&index) {
            Some(e) => Some(e.term),
            None => (self.last_purged.index == index).then_some(self.last_purged.term),
        }
    }
}

struct MemData {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    applied: LogId,
}

/// In-memory backing shared by [`MemLogStorage`] and [`MemStateMachine`].
///
/// Intended for tests; contents live as long as the `Arc` does, which lets a
/// test "restart" a replica by reopening it over the same store.
pub struct MemStore {
    log: RwLock<MemLog>,
    sm: RwLock<MemData>,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(MemStore {
            log: RwLock::new(MemLog {
                entries: BTreeMap::new(),
                last_purged: LogId::default(),
                hard_state: HardState::default(),
            }),
            sm: RwLock::new(MemData { data: BTreeMap::new(), applied: LogId::default() }),
        })
    }
}

// ---------------------------------------------------------------------------
// MemLogStorage
// ---------------------------------------------------------------------------

/// In-memory `LogStorage` backed by a `BTreeMap`.
pub struct MemLogStorage(pub Arc<MemStore>);

impl Default for MemLogStorage {
    fn default() -> Self {
        MemLogStorage(MemStore::new())
    }
}

impl LogStorage for MemLogStorage {
    async fn log_state(&self) -> Result<LogState, TkvError> {
        let g = self.0.log.read().await;
        let last = g.entries.values().next_back().map(Entry::log_id).unwrap_or(g.last_purged);
        Ok(LogState { last_purged: g.last_purged, last })
    }

    async fn entries(&self, lo: LogIndex, hi: LogIndex) -> Result<Vec<Entry>, TkvError> {
        if lo >= hi {
            return Ok(Vec::new());
        }
        let g = self.0.log.read().await;
        Ok(g.entries.range(lo..hi).map(|(_, e)| e.clone()).collect())
    }

    async fn term(&self, index: LogIndex) -> Result<Option<Term>, TkvError> {
        Ok(self.0.log.read().await.term_of(index))
    }

    async fn append(&self, entries: Vec<Entry>) -> Result<(), TkvError> {
        let Some(first) = entries.first().map(|e| e.index) else {
            return Ok(());
        };
        let mut g = self.0.log.write().await;
        g.entries.retain(|&i, _| i < first);
        for entry in entries {
            g.entries.insert(entry.index, entry);
        }
        Ok(())
    }

    async fn compact(&self, index: LogIndex) -> Result<(), TkvError> {
        let mut g = self.0.log.write().await;
        if index <= g.last_purged.index {
            return Ok(());
        }
        let term = g.term_of(index).ok_or_else(|| {
            TkvError::Storage(format!("cannot compact through missing index {index}"))
        })?;
        let tail = g.entries.split_off(&(index + 1));
        g.entries = tail;
        g.last_purged = LogId::new(term, index);
        Ok(())
    }

    async fn hard_state(&self) -> Result<HardState, TkvError> {
        Ok(self.0.log.read().await.hard_state)
    }

    async fn save_hard_state(&self, hs: HardState) -> Result<(), TkvError> {
        self.0.log.write().await.hard_state = hs;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemStateMachine
// ---------------------------------------------------------------------------

/// In-memory `StateMachineStore` backed by a `BTreeMap`.
pub struct MemStateMachine(pub Arc<MemStore>);

impl MemStateMachine {
    pub fn new(store: Arc<MemStore>) -> Self {
        MemStateMachine(store)
    }
}

impl StateMachineStore for MemStateMachine {
    async fn applied(&self) -> Result<LogId, TkvError> {
        Ok(self.0.sm.read().await.applied)
    }

    async fn apply(&self, entry: LogId, commands: Vec<Command>) -> Result<(), TkvError> {
        let mut g = self.0.sm.write().await;
        if entry.index <= g.applied.index {
            return Ok(());
        }
        for cmd in commands {
            match cmd {
                Command::Put { key, value } => {
                    g.data.insert(key, value);
                }
                Command::Delete { key } => {
                    g.data.remove(&key);
                }
            }
        }
        g.applied = entry;
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TkvError> {
        Ok(self.0.sm.read().await.data.get(key).cloned())
    }

    async fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KvPair>, TkvError> {
        if !end.is_empty() && start >= end {
            return Ok(Vec::new());
        }
        let g = self.0.sm.read().await;
        Ok(g.data
            .range(start.to_vec()..)
            .take_while(|(k, _)| end.is_empty() || k.as_slice() < end)
            .take(limit)
            .map(|(k, v)| KvPair { key: k.clone(), value: v.clone() })
            .collect())
    }

    async fn flush(&self) -> Result<(), TkvError> {
        Ok(())
    }

    async fn build_snapshot(&self, conf_state: ConfState) -> Result<Snapshot, TkvError> {
        let g = self.0.sm.read().await;
        let contents = SnapshotContents {
            pairs: g.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        Ok(Snapshot {
            meta: SnapshotMeta { index: g.applied.index, term: g.applied.term, conf_state },
            data: encode(&contents)?,
        })
    }

    async fn install_snapshot(&self, snapshot: Snapshot) -> Result<(), TkvError> {
        let contents: SnapshotContents = decode(&snapshot.data)?;
        let boundary = snapshot.meta.log_id();

        let mut sm = self.0.sm.write().await;
        let mut log = self.0.log.write().await;

        if log.term_of(boundary.index) == Some(boundary.term) {
            let tail = log.entries.split_off(&(boundary.index + 1));
            log.entries = tail;
        } else {
            log.entries.clear();
        }
        log.last_purged = boundary;
        log.hard_state.commit = log.hard_state.commit.max(boundary.index);

        sm.data = contents.pairs.into_iter().collect();
        sm.applied = boundary;
        Ok(())
    }
}
