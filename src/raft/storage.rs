use std::fs;
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::{GetEntriesContext, RaftState, Storage};
use tracing::{debug, info, warn};

use crate::fs::errors::{Result, SporkError};

/// Durable raft log storage.
///
/// On-disk layout under the raft directory:
/// - `entries`: append-only `[u64 size BE][eraftpb.Entry bytes]` records.
///   Slot 0 is a zero-sized sentinel record mirroring the consensus
///   convention that index 0 is reserved; its index/term always track the
///   current snapshot.
/// - `hardState`, `snapshot`: single marshalled messages, replaced
///   atomically via write-to-temp-then-rename.
pub struct DiskStorage {
    inner: Mutex<Inner>,
}

struct StoredEntry {
    size: u64,
    offset: u64,
    entry: Entry,
}

struct Inner {
    entries_path: PathBuf,
    hard_state_path: PathBuf,
    snapshot_path: PathBuf,
    entries_file: fs::File,
    entries: Vec<StoredEntry>,
    hard_state: HardState,
    snapshot: Snapshot,
}

impl DiskStorage {
    pub fn open(dir: &Path, conf_state: ConfState) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let entries_path = dir.join("entries");
        let entries_file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&entries_path)?;

        let mut inner = Inner {
            entries_path,
            hard_state_path: dir.join("hardState"),
            snapshot_path: dir.join("snapshot"),
            entries_file,
            entries: Vec::new(),
            hard_state: HardState::new(),
            snapshot: Snapshot::new(),
        };
        inner.recover(conf_state)?;
        Ok(DiskStorage {
            inner: Mutex::new(inner),
        })
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("raft storage poisoned")
    }

    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner();

        let mut entries = entries;
        let first = inner.first_index();
        if first > entries[0].get_index() {
            // already compacted away
            let skip = (first - entries[0].get_index()) as usize;
            if skip >= entries.len() {
                return Ok(());
            }
            entries = &entries[skip..];
        }

        let last = inner.last_index();
        let next = entries[0].get_index();
        if next > last + 1 {
            return Err(SporkError::Corruption(format!(
                "missing log entries; last: {last}, appending: {next}"
            )));
        }

        // a divergent suffix gets overwritten in place
        let sentinel_index = inner.entries[0].entry.get_index();
        inner.entries.truncate((next - sentinel_index) as usize);

        let tail = inner
            .entries
            .last()
            .map(|e| e.offset + 8 + e.size)
            .unwrap_or(8);
        let mut offset = tail;
        for entry in entries {
            let payload = entry
                .write_to_bytes()
                .map_err(|e| SporkError::Corruption(e.to_string()))?;
            let mut record = Vec::with_capacity(8 + payload.len());
            record.extend_from_slice(&(payload.len() as u64).to_be_bytes());
            record.extend_from_slice(&payload);
            inner.entries_file.write_all_at(&record, offset)?;

            debug!(
                index = entry.get_index(),
                size = payload.len(),
                "persisted raft entry"
            );
            inner.entries.push(StoredEntry {
                size: payload.len() as u64,
                offset,
                entry: entry.clone(),
            });
            offset += record.len() as u64;
        }
        // drop stale bytes of any overwritten longer suffix
        inner.entries_file.set_len(offset)?;
        inner.entries_file.sync_data()?;
        Ok(())
    }

    pub fn set_hard_state(&self, hs: HardState) -> Result<()> {
        let mut inner = self.inner();
        let bytes = hs
            .write_to_bytes()
            .map_err(|e| SporkError::Corruption(e.to_string()))?;
        write_atomic(&inner.hard_state_path, &bytes)?;
        inner.hard_state = hs;
        Ok(())
    }

    pub fn set_commit(&self, commit: u64) -> Result<()> {
        let hs = {
            let inner = self.inner();
            if inner.hard_state.get_commit() >= commit {
                return Ok(());
            }
            let mut hs = inner.hard_state.clone();
            hs.set_commit(commit);
            hs
        };
        self.set_hard_state(hs)
    }

    pub fn hard_state(&self) -> HardState {
        self.inner().hard_state.clone()
    }

    /// The archive bytes of the persisted snapshot, if one exists.
    pub fn snapshot_data(&self) -> Option<Vec<u8>> {
        let inner = self.inner();
        if inner.snapshot.get_metadata().get_index() == 0 {
            return None;
        }
        Some(inner.snapshot.get_data().to_vec())
    }

    /// Persists a new snapshot and compacts the log (in memory and on disk)
    /// up to `index`, which becomes the new sentinel.
    pub fn save_snapshot(&self, index: u64, data: Vec<u8>, conf_state: ConfState) -> Result<()> {
        let mut inner = self.inner();

        let sentinel_index = inner.entries[0].entry.get_index();
        if index <= sentinel_index {
            // already compacted past this point
            return Ok(());
        }
        if index > inner.last_index() {
            return Err(SporkError::Corruption(format!(
                "snapshot index {index} is beyond the last log index {}",
                inner.last_index()
            )));
        }
        let term = inner.entries[(index - sentinel_index) as usize].entry.get_term();

        let mut snap = Snapshot::new();
        snap.set_data(data.into());
        let metadata = snap.mut_metadata();
        metadata.set_index(index);
        metadata.set_term(term);
        metadata.set_conf_state(conf_state);

        let bytes = snap
            .write_to_bytes()
            .map_err(|e| SporkError::Corruption(e.to_string()))?;
        write_atomic(&inner.snapshot_path, &bytes)?;
        inner.snapshot = snap;

        inner.entries.drain(..(index - sentinel_index) as usize);
        inner.entries[0] = sentinel(index, term);
        inner.rewrite_entries_file()?;
        info!(index, term, "compacted raft log into snapshot");
        Ok(())
    }

    /// Installs a snapshot received from a peer: replaces the log with a
    /// fresh sentinel and fast-forwards the hard state.
    pub fn apply_snapshot(&self, snap: Snapshot) -> Result<()> {
        let mut inner = self.inner();
        let index = snap.get_metadata().get_index();
        let term = snap.get_metadata().get_term();
        if index <= inner.snapshot.get_metadata().get_index() {
            return Err(SporkError::Corruption(format!(
                "snapshot at index {index} is out of date"
            )));
        }

        let bytes = snap
            .write_to_bytes()
            .map_err(|e| SporkError::Corruption(e.to_string()))?;
        write_atomic(&inner.snapshot_path, &bytes)?;
        inner.snapshot = snap;

        inner.entries = vec![sentinel(index, term)];
        inner.rewrite_entries_file()?;

        let mut hs = inner.hard_state.clone();
        if hs.get_commit() < index {
            hs.set_commit(index);
        }
        if hs.get_term() < term {
            hs.set_term(term);
        }
        let hs_bytes = hs
            .write_to_bytes()
            .map_err(|e| SporkError::Corruption(e.to_string()))?;
        write_atomic(&inner.hard_state_path, &hs_bytes)?;
        inner.hard_state = hs;

        info!(index, term, "installed snapshot from peer");
        Ok(())
    }
}

impl Inner {
    fn first_index(&self) -> u64 {
        // slot 0 is the sentinel
        self.entries[0].entry.get_index() + 1
    }

    fn last_index(&self) -> u64 {
        self.entries[0].entry.get_index() + self.entries.len() as u64 - 1
    }

    fn recover(&mut self, conf_state: ConfState) -> Result<()> {
        match read_message::<Snapshot>(&self.snapshot_path) {
            Ok(Some(snap)) => {
                info!(
                    index = snap.get_metadata().get_index(),
                    "recovered raft snapshot"
                );
                self.snapshot = snap;
            }
            Ok(None) => {}
            Err(e) => warn!("saved snapshot isn't valid, starting fresh: {e}"),
        }
        if self
            .snapshot
            .get_metadata()
            .get_conf_state()
            .get_voters()
            .is_empty()
        {
            self.snapshot.mut_metadata().set_conf_state(conf_state);
        }

        match read_message::<HardState>(&self.hard_state_path) {
            Ok(Some(hs)) => {
                info!(
                    term = hs.get_term(),
                    commit = hs.get_commit(),
                    "recovered raft hard state"
                );
                self.hard_state = hs;
            }
            Ok(None) => {}
            Err(e) => warn!("saved hard state isn't valid, using default: {e}"),
        }

        self.recover_entries()?;

        let snap_index = self.snapshot.get_metadata().get_index();
        let snap_term = self.snapshot.get_metadata().get_term();
        // drop any entries the snapshot already covers (a crash can land
        // between snapshot persistence and the log rewrite)
        self.entries.retain(|e| e.entry.get_index() > snap_index);
        self.entries.insert(0, sentinel(snap_index, snap_term));
        Ok(())
    }

    fn recover_entries(&mut self) -> Result<()> {
        let mut entries = Vec::new();
        let mut offset = 0u64;
        let mut header = [0u8; 8];

        loop {
            match self.entries_file.read_exact_at(&mut header, offset) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let size = u64::from_be_bytes(header);

            let mut payload = vec![0u8; size as usize];
            match self.entries_file.read_exact_at(&mut payload, offset + 8) {
                Ok(()) => {}
                // a crash between the size header and the payload leaves a
                // short tail; everything before it is intact
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let entry = Entry::parse_from_bytes(&payload).map_err(|e| {
                SporkError::Corruption(format!("undecodable raft log record: {e}"))
            })?;
            entries.push(StoredEntry {
                size,
                offset,
                entry,
            });
            offset += 8 + size;
        }

        if entries.is_empty() {
            debug!("no raft log entries recovered, maybe it's a first run");
        } else {
            info!(count = entries.len(), "recovered raft log entries");
        }
        // the sentinel is re-inserted by the caller; drop the zero-sized
        // record that represented it on disk
        entries.retain(|e| e.size != 0);
        self.entries = entries;
        Ok(())
    }

    /// Rewrites the entries file to hold exactly the in-memory suffix. Used
    /// after compaction and snapshot installs; goes through a temp file so a
    /// crash leaves either the old or the new log, never a hybrid.
    fn rewrite_entries_file(&mut self) -> Result<()> {
        let tmp = self.entries_path.with_extension("new");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&[0u8; 8])?; // sentinel slot

        let mut offset = 8u64;
        for stored in self.entries.iter_mut().skip(1) {
            let payload = stored
                .entry
                .write_to_bytes()
                .map_err(|e| SporkError::Corruption(e.to_string()))?;
            file.write_all(&(payload.len() as u64).to_be_bytes())?;
            file.write_all(&payload)?;
            stored.offset = offset;
            stored.size = payload.len() as u64;
            offset += 8 + payload.len() as u64;
        }
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &self.entries_path)?;
        self.entries_file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.entries_path)?;
        Ok(())
    }
}

fn sentinel(index: u64, term: u64) -> StoredEntry {
    let mut entry = Entry::new();
    entry.set_index(index);
    entry.set_term(term);
    StoredEntry {
        size: 0,
        offset: 0,
        entry,
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("new");
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)
}

fn read_message<M: PbMessage>(path: &Path) -> Result<Option<M>> {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    M::parse_from_bytes(&bytes)
        .map(Some)
        .map_err(|e| SporkError::Corruption(e.to_string()))
}

impl Storage for DiskStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let inner = self.inner();
        Ok(RaftState::new(
            inner.hard_state.clone(),
            inner.snapshot.get_metadata().get_conf_state().clone(),
        ))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let inner = self.inner();
        if low < inner.first_index() {
            return Err(raft::Error::Store(raft::StorageError::Compacted));
        }
        if high > inner.last_index() + 1 {
            panic!(
                "requesting log entries up to {high} after last known entry {}",
                inner.last_index()
            );
        }
        if inner.entries.len() == 1 {
            return Err(raft::Error::Store(raft::StorageError::Unavailable));
        }

        let sentinel_index = inner.entries[0].entry.get_index();
        let slice = &inner.entries[(low - sentinel_index) as usize..(high - sentinel_index) as usize];

        let max_size = max_size.into().unwrap_or(u64::MAX);
        let mut total = 0u64;
        let mut result = Vec::with_capacity(slice.len());
        for (i, stored) in slice.iter().enumerate() {
            total += u64::from(stored.entry.compute_size());
            if i > 0 && total > max_size {
                break;
            }
            result.push(stored.entry.clone());
        }
        Ok(result)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let inner = self.inner();
        let sentinel_index = inner.entries[0].entry.get_index();
        if idx < sentinel_index {
            return Err(raft::Error::Store(raft::StorageError::Compacted));
        }
        if idx > inner.last_index() {
            return Err(raft::Error::Store(raft::StorageError::Unavailable));
        }
        Ok(inner.entries[(idx - sentinel_index) as usize].entry.get_term())
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.inner().first_index())
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.inner().last_index())
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let inner = self.inner();
        let snap = &inner.snapshot;
        if snap.get_metadata().get_index() == 0 || snap.get_metadata().get_index() < request_index {
            return Err(raft::Error::Store(
                raft::StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        Ok(snap.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut e = Entry::new();
        e.set_index(index);
        e.set_term(term);
        e.set_data(data.to_vec().into());
        e
    }

    fn conf_state() -> ConfState {
        let mut cs = ConfState::new();
        cs.set_voters(vec![1, 2, 3]);
        cs
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path(), conf_state()).unwrap();

        storage
            .append(&[entry(1, 1, b"a"), entry(2, 1, b"bb"), entry(3, 2, b"ccc")])
            .unwrap();

        assert_eq!(storage.first_index().unwrap(), 1);
        assert_eq!(storage.last_index().unwrap(), 3);
        assert_eq!(storage.term(2).unwrap(), 1);
        assert_eq!(storage.term(3).unwrap(), 2);

        let entries = storage
            .entries(1, 4, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].get_data(), b"ccc");
    }

    #[test]
    fn test_recovery_replays_the_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = DiskStorage::open(dir.path(), conf_state()).unwrap();
            storage
                .append(&[entry(1, 1, b"one"), entry(2, 1, b"two")])
                .unwrap();
            let mut hs = HardState::new();
            hs.set_term(1);
            hs.set_commit(2);
            storage.set_hard_state(hs).unwrap();
        }

        let storage = DiskStorage::open(dir.path(), conf_state()).unwrap();
        assert_eq!(storage.last_index().unwrap(), 2);
        assert_eq!(storage.hard_state().get_commit(), 2);
        let entries = storage
            .entries(1, 3, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(entries[0].get_data(), b"one");
        assert_eq!(entries[1].get_data(), b"two");
    }

    #[test]
    fn test_truncated_tail_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = DiskStorage::open(dir.path(), conf_state()).unwrap();
            storage
                .append(&[entry(1, 1, b"keep"), entry(2, 1, b"gone")])
                .unwrap();
        }
        // cut into the middle of the last record
        let path = dir.path().join("entries");
        let len = fs::metadata(&path).unwrap().len();
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let storage = DiskStorage::open(dir.path(), conf_state()).unwrap();
        assert_eq!(storage.last_index().unwrap(), 1);
        let entries = storage
            .entries(1, 2, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(entries[0].get_data(), b"keep");
    }

    #[test]
    fn test_divergent_suffix_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path(), conf_state()).unwrap();
        storage
            .append(&[entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])
            .unwrap();
        // a new leader rewrites indexes 2.. with a higher term
        storage
            .append(&[entry(2, 2, b"B!"), entry(3, 2, b"C!")])
            .unwrap();

        assert_eq!(storage.term(2).unwrap(), 2);
        drop(storage);

        let recovered = DiskStorage::open(dir.path(), conf_state()).unwrap();
        assert_eq!(recovered.last_index().unwrap(), 3);
        let entries = recovered
            .entries(2, 4, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(entries[0].get_data(), b"B!");
        assert_eq!(entries[1].get_data(), b"C!");
    }

    #[test]
    fn test_save_snapshot_compacts_log_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path(), conf_state()).unwrap();
        storage
            .append(&[
                entry(1, 1, b"a"),
                entry(2, 1, b"b"),
                entry(3, 1, b"c"),
                entry(4, 1, b"d"),
            ])
            .unwrap();

        storage
            .save_snapshot(3, b"state".to_vec(), conf_state())
            .unwrap();

        assert_eq!(storage.first_index().unwrap(), 4);
        assert_eq!(storage.last_index().unwrap(), 4);
        assert_eq!(storage.term(3).unwrap(), 1); // sentinel keeps snapshot term
        assert!(matches!(
            storage.entries(3, 5, None, GetEntriesContext::empty(false)),
            Err(raft::Error::Store(raft::StorageError::Compacted))
        ));
        let snap = Storage::snapshot(&storage, 0, 0).unwrap();
        assert_eq!(snap.get_data(), b"state");

        // recovery starts from the snapshot sentinel
        drop(storage);
        let recovered = DiskStorage::open(dir.path(), conf_state()).unwrap();
        assert_eq!(recovered.first_index().unwrap(), 4);
        assert_eq!(recovered.last_index().unwrap(), 4);
        let entries = recovered
            .entries(4, 5, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(entries[0].get_data(), b"d");
    }

    #[test]
    fn test_snapshot_unavailable_until_one_exists() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path(), conf_state()).unwrap();
        assert!(matches!(
            Storage::snapshot(&storage, 0, 0),
            Err(raft::Error::Store(
                raft::StorageError::SnapshotTemporarilyUnavailable
            ))
        ));
    }

    #[test]
    fn test_apply_snapshot_resets_log() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(dir.path(), conf_state()).unwrap();
        storage.append(&[entry(1, 1, b"old")]).unwrap();

        let mut snap = Snapshot::new();
        snap.set_data(b"from-leader".to_vec().into());
        snap.mut_metadata().set_index(10);
        snap.mut_metadata().set_term(3);
        snap.mut_metadata().set_conf_state(conf_state());
        storage.apply_snapshot(snap).unwrap();

        assert_eq!(storage.first_index().unwrap(), 11);
        assert_eq!(storage.last_index().unwrap(), 10);
        assert_eq!(storage.hard_state().get_commit(), 10);

        drop(storage);
        let recovered = DiskStorage::open(dir.path(), conf_state()).unwrap();
        assert_eq!(recovered.first_index().unwrap(), 11);
        assert_eq!(
            Storage::snapshot(&recovered, 0, 0).unwrap().get_data(),
            b"from-leader"
        );
    }
}
