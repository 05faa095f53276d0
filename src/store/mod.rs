pub mod cache;
pub mod data;

use std::sync::Arc;

use crate::fs::errors::Result;
use crate::fs::file::FileId;
use crate::store::cache::Cache;
use crate::store::data::{DataDriver, PayloadReader, PayloadWriter};

/// Where a file's payload lives on this peer: the durable home store for
/// ids this peer is a home of, the TTL cache for everything else.
#[derive(Clone)]
pub enum PayloadStore {
    Home(Arc<DataDriver>),
    Cached(Arc<Cache>),
}

impl PayloadStore {
    pub fn contains(&self, id: FileId, version: u64) -> bool {
        match self {
            PayloadStore::Home(d) => d.contains(id, version),
            PayloadStore::Cached(c) => c.contains(id, version),
        }
    }

    pub async fn reader(&self, id: FileId, version: u64) -> Result<PayloadReader> {
        match self {
            PayloadStore::Home(d) => d.reader(id, version).await,
            PayloadStore::Cached(c) => c.reader(id, version).await,
        }
    }

    pub async fn writer(
        &self,
        id: FileId,
        old_version: u64,
        new_version: u64,
        truncate: bool,
    ) -> Result<PayloadWriter> {
        match self {
            PayloadStore::Home(d) => d.writer(id, old_version, new_version, truncate).await,
            PayloadStore::Cached(c) => c.writer(id, old_version, new_version, truncate).await,
        }
    }

    pub async fn open_pair(
        &self,
        id: FileId,
        old_version: u64,
        new_version: u64,
        truncate: bool,
    ) -> Result<(PayloadReader, PayloadWriter)> {
        match self {
            PayloadStore::Home(d) => d.open_pair(id, old_version, new_version, truncate).await,
            PayloadStore::Cached(c) => c.open_pair(id, old_version, new_version, truncate).await,
        }
    }

    pub async fn remove(&self, id: FileId, version: u64) {
        match self {
            PayloadStore::Home(d) => d.remove(id, version).await,
            PayloadStore::Cached(c) => c.remove(id, version).await,
        }
    }

    pub async fn size(&self, id: FileId, version: u64) -> u64 {
        match self {
            PayloadStore::Home(d) => d.size(id, version).await,
            PayloadStore::Cached(c) => c.size(id, version).await,
        }
    }
}
