use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::fs::errors::{Result, SporkError};
use crate::fs::file::{File, FileId, FileMode, Timestamp};
use crate::fs::Spork;
use crate::raft::applier::Commit;
use crate::raft::entry::LogOp;
use crate::remote::RemoteReader;
use crate::rpc::CHUNK_SIZE;
use crate::store::PayloadStore;

/// Enforces committed entries that originated on other peers (or whose
/// proposer gave up waiting). Entries arrive in log order; the tracker
/// callback carried by each commit must fire exactly once per entry, which
/// the ack handle guarantees even on failed applies.
pub(crate) async fn run(spork: Arc<Spork>, mut sync_rx: mpsc::Receiver<Commit>) {
    while let Some(commit) = sync_rx.recv().await {
        let (entry, ack) = commit.into_parts();
        match entry.op {
            LogOp::Add {
                id,
                parent_id,
                name,
                mode,
            } => {
                debug!(id, name, "processing add entry");
                if let Err(e) = spork.apply_add(id, parent_id, &name, mode).await {
                    error!(id, "add entry unsuccessful: {e}");
                }
            }
            LogOp::Rename {
                id,
                old_parent_id,
                old_name,
                new_parent_id,
                new_name,
            } => {
                debug!(id, new_name, "processing rename entry");
                if let Err(e) = spork
                    .apply_rename(id, old_parent_id, &old_name, new_parent_id, &new_name)
                    .await
                {
                    error!(id, "rename entry unsuccessful: {e}");
                }
            }
            LogOp::Delete {
                id,
                parent_id,
                name,
            } => {
                debug!(id, "processing delete entry");
                if let Err(e) = spork.apply_delete(id, parent_id, &name).await {
                    error!(id, "delete entry unsuccessful: {e}");
                }
            }
            LogOp::Change {
                id,
                version,
                offset,
                size,
                peer_id,
            } => {
                debug!(id, version, from = peer_id, "processing change entry");
                if let Err(e) = spork
                    .apply_change(id, version, offset, size, peer_id)
                    .await
                {
                    error!(id, "change entry unsuccessful: {e}");
                }
            }
        }
        ack.ack();
        debug!("finished processing entry");
    }
    debug!("apply loop stopped");
}

impl Spork {
    pub(crate) async fn apply_add(
        &self,
        id: FileId,
        parent_id: FileId,
        name: &str,
        mode: FileMode,
    ) -> Result<()> {
        let parent = self.inventory().get_any(parent_id)?;
        let _parent_guard = parent.lock.write().await;

        // an id we already know means this add is a hard link: the new
        // record must share the existing lock, version, size and times
        let file = match self.inventory().get_any(id) {
            Ok(existing) => File::link_of(&existing, name),
            Err(_) => File::create(id, name, mode),
        };
        let file_lock = file.lock.clone();
        let _file_guard = file_lock.write().await;

        self.attach_child(&parent, file).await;
        self.invalidations().send(parent.view()).ok();
        Ok(())
    }

    pub(crate) async fn apply_rename(
        &self,
        id: FileId,
        old_parent_id: FileId,
        old_name: &str,
        new_parent_id: FileId,
        new_name: &str,
    ) -> Result<()> {
        // links share ids, so the rename targets one specific record
        let file = self.inventory().get_specific(id, old_parent_id, old_name)?;
        let old_parent = self.inventory().get_any(old_parent_id)?;
        let new_parent = self.inventory().get_any(new_parent_id)?;

        let _old_parent_guard = old_parent.lock.write().await;
        let _file_guard = file.lock.write().await;
        let _new_parent_guard = if new_parent.id != old_parent.id {
            Some(new_parent.lock.write().await)
        } else {
            None
        };

        // pre-rename view first, so the adapter invalidates the old entry
        self.invalidations().send(file.view()).ok();
        self.rename_locked(&file, &old_parent, &new_parent, old_name, new_name);
        Ok(())
    }

    pub(crate) async fn apply_delete(
        &self,
        id: FileId,
        parent_id: FileId,
        name: &str,
    ) -> Result<()> {
        let file = self.inventory().get_specific(id, parent_id, name)?;
        let parent = self.inventory().get_any(parent_id)?;

        let _file_guard = file.lock.write().await;
        let _parent_guard = parent.lock.write().await;

        self.remove_link(&parent, &file).await;
        Ok(())
    }

    pub(crate) async fn apply_change(
        &self,
        id: FileId,
        version: u64,
        offset: u64,
        size: u64,
        peer_id: u64,
    ) -> Result<()> {
        let file = self.inventory().get_any(id)?;
        let _guard = file.lock.write().await;

        let old_version = file.version();
        self.inventory().set_version(id, version);
        // the payload now extends to the end of the written range
        self.inventory().set_size(id, offset + size);
        let now = Timestamp::now();
        self.inventory().set_times(id, now, now);

        let is_home = self.peers().is_local(id);
        if is_home || self.cache().contains_any(id) {
            let store = if is_home {
                PayloadStore::Home(self.data().clone())
            } else {
                PayloadStore::Cached(self.cache().clone())
            };

            match self.pull_payload(&store, id, version, peer_id).await {
                Ok(()) => {
                    if old_version != version {
                        store.remove(id, old_version).await;
                    }
                }
                // the entry still counts as applied; the payload will be
                // re-fetched the next time it's needed
                Err(e) => error!(id, version, "transferring changed payload: {e}"),
            }
        }

        for link in self.inventory().get_all(id) {
            self.invalidations().send(link.view()).ok();
        }
        Ok(())
    }

    /// Brings `(id, version)` into `store`, streaming it from the proposer
    /// when possible and from any home peer otherwise.
    ///
    /// Version keys are writer-unique (see `file::next_version`), so a
    /// payload already present under `(id, version)` is necessarily the
    /// entry's own bytes: either this peer proposed the change, or an
    /// earlier fetch landed it. Presence makes the fetch a no-op.
    async fn pull_payload(
        &self,
        store: &PayloadStore,
        id: FileId,
        version: u64,
        peer_id: u64,
    ) -> Result<()> {
        if store.contains(id, version) {
            return Ok(());
        }

        let hinted = self.peers().addr_of_raft_id(peer_id);
        let remote = match hinted {
            Some(addr) if addr != self.peers().this_addr() => {
                match self.fetcher().reader_from_peer(id, version, addr).await {
                    Ok(reader) => reader,
                    Err(e) => {
                        debug!(id, version, "proposer hint failed ({e}), trying home peers");
                        self.fetcher().reader(id, version).await?
                    }
                }
            }
            _ => self.fetcher().reader(id, version).await?,
        };

        self.fill_store(store, id, version, remote).await
    }

    pub(crate) async fn fill_store(
        &self,
        store: &PayloadStore,
        id: FileId,
        version: u64,
        mut remote: RemoteReader,
    ) -> Result<()> {
        let mut writer = store.writer(id, 0, version, true).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match remote.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    writer.cancel().await;
                    return Err(SporkError::Transport(format!(
                        "streaming payload {id}-{version}: {e}"
                    )));
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = writer.write(&buf[..n]).await {
                writer.cancel().await;
                return Err(e.into());
            }
        }
        writer.commit().await?;
        Ok(())
    }
}
