pub mod apply;
pub mod errors;
pub mod file;
pub mod inventory;
pub mod read_writer;
pub mod reader;
pub mod writer;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::fs::errors::{Result, SporkError};
use crate::fs::file::{next_version, File, FileMode, FileRef, FileView};
use crate::fs::inventory::Inventory;
use crate::fs::read_writer::ReadWriter;
use crate::fs::reader::Reader;
use crate::fs::writer::Writer;
use crate::raft::applier::Commit;
use crate::raft::peers::Peers;
use crate::raft::Raft;
use crate::remote::Fetcher;
use crate::store::cache::Cache;
use crate::store::data::DataDriver;
use crate::store::PayloadStore;
use crate::task::spawn_named;

/// The per-peer filesystem service. Binds local storage, the cache, the
/// remote fetcher, the inventory and the consensus layer; every mutation is
/// serialized through the replicated log before it touches local state.
pub struct Spork {
    inventory: Arc<Inventory>,
    data: Arc<DataDriver>,
    cache: Arc<Cache>,
    fetcher: Arc<Fetcher>,
    peers: Arc<Peers>,
    raft: Arc<Raft>,
    invalidations: mpsc::UnboundedSender<FileView>,
    deletions: mpsc::UnboundedSender<FileView>,
}

impl Spork {
    /// Wires the service and starts the apply worker over `sync_rx`, the
    /// stream of committed entries that originated on other peers. The two
    /// returned receivers feed the VFS adapter: attribute/entry
    /// invalidations and node evictions.
    pub fn new(
        inventory: Arc<Inventory>,
        data: Arc<DataDriver>,
        cache: Arc<Cache>,
        fetcher: Arc<Fetcher>,
        peers: Arc<Peers>,
        raft: Arc<Raft>,
        sync_rx: mpsc::Receiver<Commit>,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<FileView>,
        mpsc::UnboundedReceiver<FileView>,
    ) {
        let (invalidations, invalidations_rx) = mpsc::unbounded_channel();
        let (deletions, deletions_rx) = mpsc::unbounded_channel();

        let spork = Arc::new(Spork {
            inventory,
            data,
            cache,
            fetcher,
            peers,
            raft,
            invalidations,
            deletions,
        });
        spawn_named("spork-apply", apply::run(spork.clone(), sync_rx));
        (spork, invalidations_rx, deletions_rx)
    }

    pub fn root(&self) -> FileRef {
        self.inventory.root()
    }

    pub fn get(&self, id: u64) -> Result<FileRef> {
        self.inventory.get_any(id)
    }

    pub async fn lookup(&self, parent: &FileRef, name: &str) -> Result<FileRef> {
        let _guard = parent.lock.read().await;
        parent.child_named(name).ok_or(SporkError::NoSuchFile)
    }

    pub async fn create_file(
        &self,
        parent: &FileRef,
        name: &str,
        mode: FileMode,
    ) -> Result<FileRef> {
        let _parent_guard = parent.lock.write().await;
        if parent.child_named(name).is_some() {
            return Err(SporkError::FileAlreadyExists);
        }

        let id = self.inventory.new_id();
        let file = File::create(id, name, mode);
        let file_lock = file.lock.clone();
        let _file_guard = file_lock.write().await;

        let commit = self
            .raft
            .add(id, parent.id, name.to_string(), mode)
            .await?;
        self.attach_child(parent, file.clone()).await;
        commit.ack();

        debug!(id, name, "created file");
        Ok(file)
    }

    /// Hard link: the new record shares id, mode, payload lock, version,
    /// size and times with `existing`.
    pub async fn create_link(
        &self,
        existing: &FileRef,
        parent: &FileRef,
        new_name: &str,
    ) -> Result<FileRef> {
        let _parent_guard = parent.lock.write().await;
        if parent.child_named(new_name).is_some() {
            return Err(SporkError::FileAlreadyExists);
        }

        let file = File::link_of(existing, new_name);
        let file_lock = file.lock.clone();
        let _file_guard = file_lock.write().await;

        let commit = self
            .raft
            .add(existing.id, parent.id, new_name.to_string(), existing.mode)
            .await?;
        self.attach_child(parent, file.clone()).await;
        commit.ack();

        debug!(id = existing.id, new_name, "created hard link");
        Ok(file)
    }

    pub async fn rename(
        &self,
        file: &FileRef,
        old_parent: &FileRef,
        new_parent: &FileRef,
        new_name: &str,
    ) -> Result<()> {
        let _old_parent_guard = old_parent.lock.write().await;
        let _file_guard = file.lock.write().await;
        let _new_parent_guard = if new_parent.id != old_parent.id {
            Some(new_parent.lock.write().await)
        } else {
            None
        };

        if let Some(occupant) = new_parent.child_named(new_name) {
            if occupant.id != file.id || occupant.name() != file.name() {
                return Err(SporkError::FileAlreadyExists);
            }
        }

        let old_name = file.name();
        let commit = self
            .raft
            .rename(
                file.id,
                old_parent.id,
                old_name.clone(),
                new_parent.id,
                new_name.to_string(),
            )
            .await?;

        // pre-rename view, so the adapter drops the old directory entry
        self.invalidations.send(file.view()).ok();
        self.rename_locked(file, old_parent, new_parent, &old_name, new_name);
        commit.ack();

        debug!(id = file.id, old_name, new_name, "renamed file");
        Ok(())
    }

    pub async fn delete(&self, file: &FileRef) -> Result<()> {
        if file.mode.is_dir() && file.child_count() > 0 {
            return Err(SporkError::DirectoryNotEmpty);
        }
        let parent_id = file.parent().ok_or(SporkError::NoSuchFile)?;
        let parent = self.inventory.get_any(parent_id)?;

        let _file_guard = file.lock.write().await;
        let _parent_guard = parent.lock.write().await;

        let commit = self
            .raft
            .delete(file.id, parent_id, file.name())
            .await?;
        self.remove_link(&parent, file).await;
        commit.ack();

        debug!(id = file.id, "deleted file");
        Ok(())
    }

    /// Streaming reader over the current payload. Non-home peers fault the
    /// payload into the local cache first.
    pub async fn open_read(&self, file: &FileRef) -> Result<Reader> {
        let version = file.version();
        if self.peers.is_local(file.id) {
            let payload = self.data.reader(file.id, version).await?;
            Ok(Reader::new(file.clone(), payload))
        } else {
            self.ensure_cached(file.id, version).await?;
            let payload = self.cache.reader(file.id, version).await?;
            Ok(Reader::new(file.clone(), payload))
        }
    }

    /// Writer over a duplicated working copy of the current version. The
    /// version advance, payload publication and metadata broadcast all
    /// happen on close. The new version is tagged with this peer's raft id
    /// so racing writers on different peers never share a payload key.
    pub async fn open_write(&self, file: &FileRef, truncate: bool) -> Result<Writer> {
        let _guard = file.lock.write().await;
        let starting = file.version();
        let ending = next_version(starting, self.peers.this_raft_id());
        let store = self.placement(file.id);
        let out = store.writer(file.id, starting, ending, truncate).await?;
        Ok(self.writer_handle(file, starting, ending, out, store))
    }

    /// One duplicated working copy used for both reads and writes; closing
    /// the handle closes both sides.
    pub async fn read_write(&self, file: &FileRef, truncate: bool) -> Result<ReadWriter> {
        let _guard = file.lock.write().await;
        let starting = file.version();
        let ending = next_version(starting, self.peers.this_raft_id());
        let store = self.placement(file.id);
        let (payload, out) = store
            .open_pair(file.id, starting, ending, truncate)
            .await?;
        let reader = Reader::new(file.clone(), payload);
        let writer = self.writer_handle(file, starting, ending, out, store);
        Ok(ReadWriter::new(reader, writer))
    }

    /// One-shot positional read, mostly for the adapter's small requests.
    pub async fn read(&self, file: &FileRef, offset: u64, size: usize) -> Result<Vec<u8>> {
        let mut reader = self.open_read(file).await?;
        let data = reader.read_at(offset, size).await?;
        reader.close();
        Ok(data)
    }

    /// One-shot positional write: patches `data` into a copy of the current
    /// payload and commits it as a new version.
    pub async fn write(&self, file: &FileRef, offset: u64, data: &[u8]) -> Result<usize> {
        let mut writer = self.open_write(file, false).await?;
        let written = writer.write_at(offset, data).await?;
        writer.close().await?;
        Ok(written)
    }

    pub async fn shutdown(&self) {
        self.raft.shutdown().await;
    }

    fn writer_handle(
        &self,
        file: &FileRef,
        starting: u64,
        ending: u64,
        out: crate::store::data::PayloadWriter,
        store: PayloadStore,
    ) -> Writer {
        Writer::new(
            file.clone(),
            starting,
            ending,
            out,
            store,
            self.raft.clone(),
            self.inventory.clone(),
            self.invalidations.clone(),
        )
    }

    fn placement(&self, id: u64) -> PayloadStore {
        if self.peers.is_local(id) {
            PayloadStore::Home(self.data.clone())
        } else {
            PayloadStore::Cached(self.cache.clone())
        }
    }

    async fn ensure_cached(&self, id: u64, version: u64) -> Result<()> {
        if version == 0 || self.cache.contains(id, version) {
            return Ok(());
        }
        debug!(id, version, "faulting payload from a home peer");

        let remote = self.fetcher.reader(id, version).await?;
        let store = PayloadStore::Cached(self.cache.clone());
        self.fill_store(&store, id, version, remote).await
    }

    /// Inserts `file` under `parent`, evicting an existing child with the
    /// same name first (a racing create on another peer may have landed; the
    /// later add wins the name). Caller holds the parent's payload lock.
    pub(crate) async fn attach_child(&self, parent: &FileRef, file: FileRef) {
        if let Some(evicted) = parent.child_named(&file.name()) {
            debug!(name = %file.name(), "replacing file with same name");
            self.remove_link(parent, &evicted).await;
        }
        file.set_parent(Some(parent.id));
        parent.push_child(file.clone());
        parent.set_size(parent.child_count() as u64);
        self.inventory.add(file);
    }

    /// Detaches one link; on the last link of an id the payload leaves both
    /// drivers. Caller holds the file's and parent's payload locks.
    pub(crate) async fn remove_link(&self, parent: &FileRef, file: &FileRef) {
        parent.remove_child(file.id, &file.name());
        parent.set_size(parent.child_count() as u64);

        let links_survive = self.inventory.remove(file);
        if !links_survive {
            let version = file.version();
            self.data.remove(file.id, version).await;
            self.cache.remove(file.id, version).await;
        }
        self.deletions.send(file.view()).ok();
    }

    /// Applies a rename to the in-memory tree. Caller holds the locks.
    pub(crate) fn rename_locked(
        &self,
        file: &FileRef,
        old_parent: &FileRef,
        new_parent: &FileRef,
        old_name: &str,
        new_name: &str,
    ) {
        if old_parent.id == new_parent.id {
            file.set_name(new_name);
            return;
        }

        old_parent.remove_child(file.id, old_name);
        old_parent.set_size(old_parent.child_count() as u64);
        file.set_name(new_name);
        file.set_parent(Some(new_parent.id));
        new_parent.push_child(file.clone());
        new_parent.set_size(new_parent.child_count() as u64);
    }

    pub(crate) fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    pub(crate) fn peers(&self) -> &Arc<Peers> {
        &self.peers
    }

    pub(crate) fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub(crate) fn data(&self) -> &Arc<DataDriver> {
        &self.data
    }

    pub(crate) fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }

    pub(crate) fn invalidations(&self) -> &mpsc::UnboundedSender<FileView> {
        &self.invalidations
    }
}
