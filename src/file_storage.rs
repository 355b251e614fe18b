use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage::{HardState, LogStore, SnapshotStore, StateStore, StorageError, Stores};
use crate::types::{LogEntry, LogIndex, NodeId, Snapshot, Term};

/// When log appends are flushed to stable media.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// fsync after every write.
    #[default]
    Always,
    /// fsync at most once per `interval_ms`; writes in between share the next sync,
    /// which the host runs every `interval_ms` through `LogStore::flush`.
    Batch { interval_ms: u64 },
    /// fsync every write while the write rate stays at or below
    /// `max_synced_writes_per_sec`, fall back to `Batch { interval_ms }` above it.
    Adaptive {
        interval_ms: u64,
        max_synced_writes_per_sec: u32,
    },
}

/// Decides, per write, whether this write must be followed by an fsync.
#[derive(Debug)]
struct SyncGate {
    policy: FsyncPolicy,
    last_sync: Instant,
    recent_writes: VecDeque<Instant>,
    dirty: bool,
}

impl SyncGate {
    const RATE_WINDOW: Duration = Duration::from_secs(1);

    fn new(policy: FsyncPolicy) -> Self {
        Self {
            policy,
            last_sync: Instant::now(),
            recent_writes: VecDeque::new(),
            dirty: false,
        }
    }

    /// Record a write at `now` and report whether it has to be synced.
    fn on_write(&mut self, now: Instant) -> bool {
        self.dirty = true;
        while let Some(&oldest) = self.recent_writes.front() {
            if now.duration_since(oldest) > Self::RATE_WINDOW {
                self.recent_writes.pop_front();
            } else {
                break;
            }
        }
        self.recent_writes.push_back(now);

        match self.policy {
            FsyncPolicy::Always => true,
            FsyncPolicy::Batch { interval_ms } => self.interval_elapsed(now, interval_ms),
            FsyncPolicy::Adaptive {
                interval_ms,
                max_synced_writes_per_sec,
            } => {
                let rate = self.recent_writes.len();
                rate <= max_synced_writes_per_sec as usize
                    || self.interval_elapsed(now, interval_ms)
            }
        }
    }

    fn interval_elapsed(&self, now: Instant, interval_ms: u64) -> bool {
        now.duration_since(self.last_sync) >= Duration::from_millis(interval_ms)
    }

    fn synced(&mut self, now: Instant) {
        self.last_sync = now;
        self.dirty = false;
    }
}

/// Open (or create) all three file-backed stores under `dir`.
pub fn open_stores(dir: &Path, policy: FsyncPolicy) -> Result<Stores, StorageError> {
    Ok(Stores::new(
        FileStateStore::open(dir)?,
        FileLogStore::open(dir, policy)?,
        FileSnapshotStore::open(dir)?,
    ))
}

/// Write `bytes` to `path` atomically: temp file → fsync → rename → fsync dir.
fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("data");
    let tmp = dir.join(format!("{file_name}.tmp"));
    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    // Fsync the directory so the rename is visible after a crash.
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct Meta {
    current_term: Term,
    voted_for: Option<NodeId>,
}

/// Term and vote in `meta.json`. Every save is written atomically and fsynced,
/// whatever the log's fsync policy.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<HardState, StorageError> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(HardState::default());
        }
        let meta: Meta = serde_json::from_slice(&fs::read(&path)?)?;
        Ok(HardState {
            current_term: meta.current_term,
            voted_for: meta.voted_for,
        })
    }

    fn save(&mut self, term: Term, voted_for: Option<&NodeId>) -> Result<(), StorageError> {
        let meta = Meta {
            current_term: term,
            voted_for: voted_for.cloned(),
        };
        let bytes = serde_json::to_vec(&meta)?;
        write_atomic(&self.dir, &self.meta_path(), &bytes)
    }
}

/// Log entries in `log.jsonl`, one JSON object per line.
///
/// Appends go to an open handle and are synced according to the `FsyncPolicy`.
/// Truncations rewrite the whole file atomically and are always synced.
pub struct FileLogStore {
    dir: PathBuf,
    file: File,
    gate: SyncGate,
}

impl FileLogStore {
    pub fn open(dir: &Path, policy: FsyncPolicy) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        let path = dir.join("log.jsonl");
        repair_torn_tail(&path)?;
        let file = Self::open_append(&path)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            gate: SyncGate::new(policy),
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    /// Force any batched appends to disk.
    pub fn sync(&mut self) -> Result<(), StorageError> {
        if self.gate.dirty {
            self.file.sync_data()?;
            self.gate.synced(Instant::now());
        }
        Ok(())
    }

    fn read_entries(&self) -> Result<Vec<LogEntry>, StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    /// Rewrite log.jsonl with `entries` atomically and reopen the append handle.
    fn rewrite(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut bytes = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut bytes, entry)?;
            bytes.push(b'\n');
        }
        write_atomic(&self.dir, &self.log_path(), &bytes)?;
        self.file = Self::open_append(&self.log_path())?;
        self.gate.synced(Instant::now());
        Ok(())
    }
}

/// Drop a final record cut short by a crash mid-append. Such a record was never
/// acknowledged. Damage anywhere else is left for `read_entries` to report.
fn repair_torn_tail(path: &Path) -> Result<(), StorageError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if matches!(bytes.last(), None | Some(b'\n')) {
        return Ok(());
    }

    let keep = bytes
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos + 1);
    let mut file = OpenOptions::new().write(true).open(path)?;
    if serde_json::from_slice::<LogEntry>(&bytes[keep..]).is_ok() {
        // Complete record missing only its newline.
        file.seek(SeekFrom::End(0))?;
        file.write_all(b"\n")?;
    } else {
        warn!(
            path = %path.display(),
            dropped_bytes = bytes.len() - keep,
            "discarding torn record at end of log"
        );
        file.set_len(keep as u64)?;
    }
    file.sync_all()?;
    Ok(())
}

impl LogStore for FileLogStore {
    fn get_all(&self) -> Result<Vec<LogEntry>, StorageError> {
        self.read_entries()
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut bytes = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut bytes, entry)?;
            bytes.push(b'\n');
        }
        self.file.write_all(&bytes)?;

        let now = Instant::now();
        if self.gate.on_write(now) {
            self.file.sync_data()?;
            self.gate.synced(now);
        }
        Ok(())
    }

    fn truncate_suffix(&mut self, from: LogIndex) -> Result<(), StorageError> {
        let kept: Vec<LogEntry> = self
            .read_entries()?
            .into_iter()
            .filter(|e| e.index < from)
            .collect();
        self.rewrite(&kept)
    }

    fn truncate_prefix(&mut self, through: LogIndex) -> Result<(), StorageError> {
        let kept: Vec<LogEntry> = self
            .read_entries()?
            .into_iter()
            .filter(|e| e.index > through)
            .collect();
        self.rewrite(&kept)
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.sync()
    }

    fn flush_interval(&self) -> Option<Duration> {
        match self.gate.policy {
            FsyncPolicy::Always => None,
            FsyncPolicy::Batch { interval_ms } | FsyncPolicy::Adaptive { interval_ms, .. } => {
                Some(Duration::from_millis(interval_ms.max(1)))
            }
        }
    }
}

impl Drop for FileLogStore {
    fn drop(&mut self) {
        if let Err(err) = self.sync() {
            warn!(error = %err, "failed to flush batched log appends on close");
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotHeader {
    last_included_index: LogIndex,
    last_included_term: Term,
    len: u64,
}

/// Latest snapshot in `snapshot.bin`: an 8-byte big-endian header length, a JSON header,
/// then the raw snapshot bytes. Replaced atomically on every save.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot.bin")
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&path)?;
        let mut len_buf = [0u8; 8];
        file.read_exact(&mut len_buf)?;
        let header_len = usize::try_from(u64::from_be_bytes(len_buf))
            .map_err(|_| StorageError::Inconsistent("snapshot header too large".into()))?;
        let mut header_buf = vec![0u8; header_len];
        file.read_exact(&mut header_buf)?;
        let header: SnapshotHeader = serde_json::from_slice(&header_buf)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        if data.len() as u64 != header.len {
            return Err(StorageError::Inconsistent(format!(
                "snapshot data is {} bytes, header says {}",
                data.len(),
                header.len
            )));
        }

        Ok(Some(Snapshot {
            last_included_index: header.last_included_index,
            last_included_term: header.last_included_term,
            data,
        }))
    }

    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let header = serde_json::to_vec(&SnapshotHeader {
            last_included_index: snapshot.last_included_index,
            last_included_term: snapshot.last_included_term,
            len: snapshot.data.len() as u64,
        })?;
        let mut bytes = Vec::with_capacity(8 + header.len() + snapshot.data.len());
        bytes.extend_from_slice(&(header.len() as u64).to_be_bytes());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&snapshot.data);
        write_atomic(&self.dir, &self.snapshot_path(), &bytes)
    }
}
