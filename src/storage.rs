use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::types::{LogEntry, LogIndex, NodeId, Snapshot, Term};

/// Error type for every store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt storage: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("inconsistent storage: {0}")]
    Inconsistent(String),
}

/// Persistent term state: current term and the vote cast in it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// §5.1, Figure 2 (Persistent state on all servers): currentTerm and votedFor must survive
/// crashes. `save` must be durable before it returns: the core answers RPCs right after.
pub trait StateStore: Send {
    fn load(&self) -> Result<HardState, StorageError>;

    fn save(&mut self, term: Term, voted_for: Option<&NodeId>) -> Result<(), StorageError>;
}

/// Ordered log entries. Indices are absolute, so entries keep their position across
/// prefix compaction.
pub trait LogStore: Send {
    fn get_all(&self) -> Result<Vec<LogEntry>, StorageError>;

    /// Append entries that directly follow the current last entry.
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Remove `from` and every later entry.
    fn truncate_suffix(&mut self, from: LogIndex) -> Result<(), StorageError>;

    /// Remove every entry up to and including `through` once a snapshot covers them.
    fn truncate_prefix(&mut self, through: LogIndex) -> Result<(), StorageError>;

    /// Make appends that the sync policy deferred durable. Called periodically.
    fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    /// How often `flush` should run. `None` when every append is already durable.
    fn flush_interval(&self) -> Option<Duration> {
        None
    }
}

/// Latest snapshot blob plus its metadata. Saving replaces the previous snapshot.
pub trait SnapshotStore: Send {
    fn load(&self) -> Result<Option<Snapshot>, StorageError>;

    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;
}

/// The three persistence collaborators handed to a node at construction.
pub struct Stores {
    pub state: Box<dyn StateStore>,
    pub log: Box<dyn LogStore>,
    pub snapshot: Box<dyn SnapshotStore>,
}

impl Stores {
    pub fn new(
        state: impl StateStore + 'static,
        log: impl LogStore + 'static,
        snapshot: impl SnapshotStore + 'static,
    ) -> Self {
        Self {
            state: Box::new(state),
            log: Box::new(log),
            snapshot: Box::new(snapshot),
        }
    }

    /// Fresh in-memory stores.
    pub fn memory() -> Self {
        Self::new(
            MemoryStateStore::new(),
            MemoryLogStore::new(),
            MemorySnapshotStore::new(),
        )
    }
}

/// In-memory term state. Clones share the same contents, so a test can keep a handle
/// and inspect what the node persisted.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<HardState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hard_state(&self) -> HardState {
        self.inner.lock().clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<HardState, StorageError> {
        Ok(self.inner.lock().clone())
    }

    fn save(&mut self, term: Term, voted_for: Option<&NodeId>) -> Result<(), StorageError> {
        *self.inner.lock() = HardState {
            current_term: term,
            voted_for: voted_for.cloned(),
        };
        Ok(())
    }
}

/// In-memory log. Clones share the same entries.
#[derive(Clone, Default)]
pub struct MemoryLogStore {
    inner: Arc<Mutex<Vec<LogEntry>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<LogEntry>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(entries)),
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.lock().clone()
    }
}

impl LogStore for MemoryLogStore {
    fn get_all(&self) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self.inner.lock().clone())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut log = self.inner.lock();
        if let (Some(last), Some(first)) = (log.last(), entries.first()) {
            if first.index != last.index.next() {
                return Err(StorageError::Inconsistent(format!(
                    "append at {} does not follow {}",
                    first.index, last.index
                )));
            }
        }
        log.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_suffix(&mut self, from: LogIndex) -> Result<(), StorageError> {
        self.inner.lock().retain(|e| e.index < from);
        Ok(())
    }

    fn truncate_prefix(&mut self, through: LogIndex) -> Result<(), StorageError> {
        self.inner.lock().retain(|e| e.index > through);
        Ok(())
    }
}

/// In-memory snapshot slot. Clones share the same snapshot.
#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    inner: Arc<Mutex<Option<Snapshot>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<Snapshot> {
        self.inner.lock().clone()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.inner.lock().clone())
    }

    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        *self.inner.lock() = Some(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64, command: &str) -> LogEntry {
        LogEntry::new(LogIndex::from(index), Term::from(term), command.as_bytes().to_vec())
    }

    #[test]
    fn memory_state_store_term_and_vote() {
        let mut store = MemoryStateStore::new();
        assert_eq!(store.load().unwrap(), HardState::default());

        store.save(Term::from(5), Some(&NodeId::from("n3"))).unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.current_term, Term::from(5));
        assert_eq!(state.voted_for, Some(NodeId::from("n3")));
    }

    #[test]
    fn memory_state_store_clones_share_contents() {
        let store = MemoryStateStore::new();
        let mut writer = store.clone();
        writer.save(Term::from(2), None).unwrap();
        assert_eq!(store.hard_state().current_term, Term::from(2));
    }

    #[test]
    fn memory_log_store_append_and_truncate() {
        let mut store = MemoryLogStore::new();
        store
            .append(&[entry(1, 1, "a"), entry(2, 1, "b"), entry(3, 1, "c")])
            .unwrap();

        store.truncate_suffix(LogIndex::from(3)).unwrap();
        assert_eq!(store.get_all().unwrap().len(), 2);

        store.truncate_prefix(LogIndex::from(1)).unwrap();
        assert_eq!(store.get_all().unwrap(), vec![entry(2, 1, "b")]);
    }

    #[test]
    fn memory_log_store_rejects_gap() {
        let mut store = MemoryLogStore::new();
        store.append(&[entry(1, 1, "a")]).unwrap();
        let err = store.append(&[entry(3, 1, "c")]).unwrap_err();
        assert!(matches!(err, StorageError::Inconsistent(_)));
    }

    #[test]
    fn memory_snapshot_store_replaces_previous() {
        let mut store = MemorySnapshotStore::new();
        assert!(store.load().unwrap().is_none());

        for i in [10, 20] {
            store
                .save(&Snapshot {
                    last_included_index: LogIndex::from(i),
                    last_included_term: Term::from(1),
                    data: vec![i as u8],
                })
                .unwrap();
        }

        let snapshot = store.load().unwrap().unwrap();
        assert_eq!(snapshot.last_included_index, LogIndex::from(20));
    }
}
