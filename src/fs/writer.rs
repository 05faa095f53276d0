use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::fs::errors::{Result, SporkError};
use crate::fs::file::{FileRef, FileView, Timestamp};
use crate::fs::inventory::Inventory;
use crate::raft::Raft;
use crate::store::data::PayloadWriter;
use crate::store::PayloadStore;

/// Write handle bound to the `starting_version → ending_version`
/// transition of one file.
///
/// Every write re-checks that the file is still at `starting_version`;
/// version drift means another writer's commit won the race and this handle
/// is stale. Close is where the transition happens: commit the working
/// copy, vote the change through consensus, and only then advance the
/// file's version and retire the previous payload.
pub struct Writer {
    file: FileRef,
    starting_version: u64,
    ending_version: u64,
    out: PayloadWriter,
    written: bool,
    store: PayloadStore,
    raft: Arc<Raft>,
    inventory: Arc<Inventory>,
    invalidations: mpsc::UnboundedSender<FileView>,
}

impl Writer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        file: FileRef,
        starting_version: u64,
        ending_version: u64,
        out: PayloadWriter,
        store: PayloadStore,
        raft: Arc<Raft>,
        inventory: Arc<Inventory>,
        invalidations: mpsc::UnboundedSender<FileView>,
    ) -> Self {
        Writer {
            file,
            starting_version,
            ending_version,
            out,
            written: false,
            store,
            raft,
            inventory,
            invalidations,
        }
    }

    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        let _guard = self.file.lock.write().await;
        if self.file.version() != self.starting_version {
            return Err(SporkError::StaleHandle);
        }
        let n = self.out.write_at(offset, data).await?;
        self.written = true;
        Ok(n)
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let _guard = self.file.lock.write().await;
        if self.file.version() != self.starting_version {
            return Err(SporkError::StaleHandle);
        }
        let n = self.out.write(data).await?;
        self.written = true;
        Ok(n)
    }

    /// Flushes the working copy to disk.
    pub async fn sync(&mut self) -> Result<()> {
        Ok(self.out.sync().await?)
    }

    /// Finalizes the handle.
    ///
    /// Stale version ⇒ the working copy is discarded and `StaleHandle`
    /// surfaces. Nothing written ⇒ discarded silently. Otherwise the new
    /// version is committed locally and proposed as a change; a rejected
    /// proposal leaves the committed payload on disk (the entry may still
    /// be in flight, and the apply loop will want the bytes if it lands)
    /// but does not advance the file's version.
    pub async fn close(self) -> Result<()> {
        let lock = self.file.lock.clone();
        let _guard = lock.write().await;

        if self.file.version() != self.starting_version {
            self.out.cancel().await;
            return Err(SporkError::StaleHandle);
        }
        if !self.written {
            self.out.cancel().await;
            return Ok(());
        }

        let size = self.out.commit().await?;
        let commit = match self
            .raft
            .change(self.file.id, self.ending_version, size)
            .await
        {
            Ok(commit) => commit,
            Err(e) => {
                warn!(
                    id = self.file.id,
                    version = self.ending_version,
                    "couldn't vote file change in raft; changes not visible, payload retained"
                );
                return Err(e);
            }
        };

        self.store.remove(self.file.id, self.starting_version).await;

        self.inventory.set_version(self.file.id, self.ending_version);
        self.inventory.set_size(self.file.id, size);
        let now = Timestamp::now();
        self.inventory.set_times(self.file.id, now, now);

        for link in self.inventory.get_all(self.file.id) {
            if !Arc::ptr_eq(&link, &self.file) {
                self.invalidations.send(link.view()).ok();
            }
        }
        commit.ack();

        debug!(
            id = self.file.id,
            version = self.ending_version,
            size,
            "successfully closed file"
        );
        Ok(())
    }
}
