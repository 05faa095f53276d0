use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error};

use crate::fs::errors::{Result, SporkError};
use crate::fs::file::FileId;
use crate::task::spawn_named;

type Index = HashMap<FileId, HashMap<u64, String>>;

/// Content store keyed by `(id, version)`. Each payload is one file named
/// `<id>-<version>` under the storage root; the in-memory index is rebuilt
/// from those names on startup, so the filesystem is the source of truth.
///
/// Version 0 is the "no payload yet" sentinel: always present, always
/// empty, never touches disk.
pub struct DataDriver {
    root: PathBuf,
    index: Arc<RwLock<Index>>,
}

impl DataDriver {
    pub async fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).await?;

        let mut index: Index = HashMap::new();
        let mut dir = fs::read_dir(&root).await?;
        while let Some(dirent) = dir.next_entry().await? {
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            match parse_payload_name(name) {
                Some((id, version)) => {
                    index.entry(id).or_default().insert(version, name.to_string());
                }
                None => debug!(name, "skipping non-payload file in storage root"),
            }
        }

        debug!(root = %root.display(), files = index.len(), "restored payload index");
        Ok(DataDriver {
            root,
            index: Arc::new(RwLock::new(index)),
        })
    }

    pub fn contains(&self, id: FileId, version: u64) -> bool {
        version == 0
            || self
                .index
                .read()
                .expect("payload index poisoned")
                .get(&id)
                .is_some_and(|versions| versions.contains_key(&version))
    }

    pub fn contains_any(&self, id: FileId) -> bool {
        self.index
            .read()
            .expect("payload index poisoned")
            .get(&id)
            .is_some_and(|versions| !versions.is_empty())
    }

    pub fn versions(&self, id: FileId) -> Vec<u64> {
        self.index
            .read()
            .expect("payload index poisoned")
            .get(&id)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }

    pub async fn size(&self, id: FileId, version: u64) -> u64 {
        let Some(rel) = self.location(id, version) else {
            return 0;
        };
        match fs::metadata(self.root.join(rel)).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        }
    }

    pub async fn reader(&self, id: FileId, version: u64) -> Result<PayloadReader> {
        if version == 0 {
            return Ok(PayloadReader::empty());
        }
        let rel = self.location(id, version).ok_or(SporkError::NoSuchFile)?;
        let file = fs::File::open(self.root.join(&rel)).await.map_err(|e| {
            SporkError::Corruption(format!("payload {id}-{version} was indexed but not on disk: {e}"))
        })?;
        Ok(PayloadReader::from_file(file))
    }

    /// Opens a writer for the `old_version → new_version` transition. The
    /// working copy is a fresh file when there is no previous payload (or
    /// the caller truncates), otherwise a duplicate of the old payload. The
    /// new version is not indexed until the writer commits.
    pub async fn writer(
        &self,
        id: FileId,
        old_version: u64,
        new_version: u64,
        truncate: bool,
    ) -> Result<PayloadWriter> {
        let final_rel = payload_name(id, new_version);
        let working_rel = format!("{final_rel}.w{:08x}", rand::random::<u32>());
        let working = self.root.join(&working_rel);

        if old_version == 0 || truncate {
            fs::File::create(&working).await?;
        } else {
            let old_rel = self.location(id, old_version).ok_or(SporkError::NoSuchFile)?;
            fs::copy(self.root.join(&old_rel), &working).await?;
        }

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&working)
            .await?;
        Ok(PayloadWriter {
            file,
            working,
            final_path: self.root.join(&final_rel),
            final_rel,
            id,
            version: new_version,
            index: self.index.clone(),
            finished: false,
        })
    }

    /// Reader and writer over the same working copy; used by handles opened
    /// for both reading and writing.
    pub async fn open_pair(
        &self,
        id: FileId,
        old_version: u64,
        new_version: u64,
        truncate: bool,
    ) -> Result<(PayloadReader, PayloadWriter)> {
        let writer = self.writer(id, old_version, new_version, truncate).await?;
        let reader = fs::File::open(&writer.working).await?;
        Ok((PayloadReader::from_file(reader), writer))
    }

    /// Drops `(id, version)`; idempotent. The unlink happens in the
    /// background, like every other payload removal.
    pub async fn remove(&self, id: FileId, version: u64) {
        if version == 0 {
            return;
        }
        let rel = {
            let mut index = self.index.write().expect("payload index poisoned");
            let Some(versions) = index.get_mut(&id) else {
                return;
            };
            let rel = versions.remove(&version);
            if versions.is_empty() {
                index.remove(&id);
            }
            rel
        };
        if let Some(rel) = rel {
            let path = self.root.join(rel);
            spawn_named("payload-unlink", async move {
                match fs::remove_file(&path).await {
                    Ok(()) => debug!(path = %path.display(), "removed payload"),
                    Err(e) => error!(path = %path.display(), "couldn't remove payload: {e}"),
                }
            });
        }
    }

    fn location(&self, id: FileId, version: u64) -> Option<String> {
        self.index
            .read()
            .expect("payload index poisoned")
            .get(&id)
            .and_then(|versions| versions.get(&version))
            .cloned()
    }
}

fn payload_name(id: FileId, version: u64) -> String {
    format!("{id}-{version}")
}

fn parse_payload_name(name: &str) -> Option<(FileId, u64)> {
    let (id, version) = name.split_once('-')?;
    Some((id.parse().ok()?, version.parse().ok()?))
}

enum PayloadSource {
    File(fs::File),
    Empty,
}

/// Byte reader over one payload. Reads are positional; the handle keeps no
/// shared state, so concurrent readers each open their own.
pub struct PayloadReader {
    source: PayloadSource,
}

impl PayloadReader {
    fn empty() -> Self {
        PayloadReader {
            source: PayloadSource::Empty,
        }
    }

    fn from_file(file: fs::File) -> Self {
        PayloadReader {
            source: PayloadSource::File(file),
        }
    }

    /// Reads up to `len` bytes at `offset`. A short (or empty) result means
    /// end of payload.
    pub async fn read_at(&mut self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let file = match &mut self.source {
            PayloadSource::Empty => return Ok(Vec::new()),
            PayloadSource::File(file) => file,
        };
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    pub async fn len(&mut self) -> std::io::Result<u64> {
        match &self.source {
            PayloadSource::Empty => Ok(0),
            PayloadSource::File(file) => Ok(file.metadata().await?.len()),
        }
    }
}

/// Write handle over an uncommitted working copy. `commit` publishes the
/// payload under `(id, version)` by atomically renaming it into place and
/// indexing it; `cancel` discards it. Neither has happened by drop time ⇒
/// the working file is cleaned up.
pub struct PayloadWriter {
    file: fs::File,
    working: PathBuf,
    final_path: PathBuf,
    final_rel: String,
    id: FileId,
    version: u64,
    index: Arc<RwLock<Index>>,
    finished: bool,
}

impl PayloadWriter {
    /// Sequential write at the current cursor.
    pub async fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.file.write_all(data).await?;
        Ok(data.len())
    }

    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(data.len())
    }

    pub async fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_data().await
    }

    /// Publishes the working copy. Returns the committed payload size.
    pub async fn commit(mut self) -> std::io::Result<u64> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        fs::rename(&self.working, &self.final_path).await?;
        self.finished = true;

        self.index
            .write()
            .expect("payload index poisoned")
            .entry(self.id)
            .or_default()
            .insert(self.version, self.final_rel.clone());

        let size = fs::metadata(&self.final_path).await?.len();
        debug!(id = self.id, version = self.version, size, "committed payload");
        Ok(size)
    }

    /// Discards the working copy without indexing anything.
    pub async fn cancel(mut self) {
        self.finished = true;
        if let Err(e) = fs::remove_file(&self.working).await {
            error!(path = %self.working.display(), "couldn't discard working payload: {e}");
        }
    }
}

impl Drop for PayloadWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.working);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn driver(dir: &tempfile::TempDir) -> DataDriver {
        DataDriver::open(dir.path().to_path_buf()).await.unwrap()
    }

    #[tokio::test]
    async fn test_version_zero_is_always_present_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let d = driver(&dir).await;
        assert!(d.contains(42, 0));
        assert!(!d.contains_any(42));
        let mut r = d.reader(42, 0).await.unwrap();
        assert!(r.read_at(0, 16).await.unwrap().is_empty());
        assert_eq!(d.size(42, 0).await, 0);
    }

    #[tokio::test]
    async fn test_commit_publishes_and_cancel_discards() {
        let dir = tempfile::tempdir().unwrap();
        let d = driver(&dir).await;

        let mut w = d.writer(7, 0, 1, false).await.unwrap();
        w.write(b"hello").await.unwrap();
        assert!(!d.contains(7, 1), "uncommitted version must not be indexed");
        assert_eq!(w.commit().await.unwrap(), 5);
        assert!(d.contains(7, 1));

        let mut r = d.reader(7, 1).await.unwrap();
        assert_eq!(r.read_at(0, 16).await.unwrap(), b"hello");

        let mut w = d.writer(7, 1, 2, true).await.unwrap();
        w.write(b"scrapped").await.unwrap();
        w.cancel().await;
        assert!(!d.contains(7, 2));
        assert!(d.contains(7, 1));
    }

    #[tokio::test]
    async fn test_writer_duplicates_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let d = driver(&dir).await;

        let mut w = d.writer(9, 0, 1, false).await.unwrap();
        w.write(b"0123456789").await.unwrap();
        w.commit().await.unwrap();

        // partial overwrite on top of a copy of v1
        let mut w = d.writer(9, 1, 2, false).await.unwrap();
        w.write_at(3, b"XYZ").await.unwrap();
        assert_eq!(w.commit().await.unwrap(), 10);

        let mut r = d.reader(9, 2).await.unwrap();
        assert_eq!(r.read_at(0, 16).await.unwrap(), b"012XYZ6789");
        // the old version is untouched
        let mut r = d.reader(9, 1).await.unwrap();
        assert_eq!(r.read_at(0, 16).await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_truncate_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let d = driver(&dir).await;

        let mut w = d.writer(5, 0, 1, false).await.unwrap();
        w.write(b"long old content").await.unwrap();
        w.commit().await.unwrap();

        let mut w = d.writer(5, 1, 2, true).await.unwrap();
        w.write(b"new").await.unwrap();
        w.commit().await.unwrap();

        let mut r = d.reader(5, 2).await.unwrap();
        assert_eq!(r.read_at(0, 32).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_index_rebuilds_from_filenames() {
        let dir = tempfile::tempdir().unwrap();
        {
            let d = driver(&dir).await;
            let mut w = d.writer(11, 0, 3, false).await.unwrap();
            w.write(b"persisted").await.unwrap();
            w.commit().await.unwrap();
        }
        // a stray non-payload file must be ignored
        std::fs::write(dir.path().join("not-a-payload.txt"), b"x").unwrap();

        let d = driver(&dir).await;
        assert!(d.contains(11, 3));
        assert!(d.contains_any(11));
        let mut r = d.reader(11, 3).await.unwrap();
        assert_eq!(r.read_at(0, 32).await.unwrap(), b"persisted");
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let d = driver(&dir).await;
        let mut w = d.writer(2, 0, 1, false).await.unwrap();
        w.write(b"x").await.unwrap();
        w.commit().await.unwrap();

        d.remove(2, 1).await;
        assert!(!d.contains(2, 1));
        d.remove(2, 1).await;
        d.remove(2, 99).await;
    }

    #[tokio::test]
    async fn test_open_pair_shares_the_working_copy() {
        let dir = tempfile::tempdir().unwrap();
        let d = driver(&dir).await;

        let (mut r, mut w) = d.open_pair(3, 0, 1, false).await.unwrap();
        w.write(b"shared bytes").await.unwrap();
        w.sync().await.unwrap();
        assert_eq!(r.read_at(0, 32).await.unwrap(), b"shared bytes");
        w.commit().await.unwrap();
    }
}
