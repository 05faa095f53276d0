use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::fs::errors::Result;
use crate::fs::file::FileId;
use crate::store::data::{DataDriver, PayloadReader, PayloadWriter};
use crate::task::spawn_named;

/// How long a cached payload survives without being touched.
pub const EXPIRY: Duration = Duration::from_secs(5 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Expiry policy over a data driver, for payloads this peer is not a home
/// of. Every read/write/contains touch pushes the `(id, version)` deadline
/// out to [`EXPIRY`]; a background sweeper evicts whatever lapses. `remove`
/// deliberately does not refresh.
pub struct Cache {
    driver: Arc<DataDriver>,
    deadlines: DashMap<(FileId, u64), Instant>,
}

impl Cache {
    pub fn new(driver: Arc<DataDriver>) -> Arc<Self> {
        let cache = Arc::new(Cache {
            driver,
            deadlines: DashMap::new(),
        });
        spawn_named("cache-sweeper", Arc::clone(&cache).sweep());
        cache
    }

    fn keep_alive(&self, id: FileId, version: u64) {
        if version == 0 {
            return;
        }
        self.deadlines
            .insert((id, version), Instant::now() + EXPIRY);
    }

    fn keep_alive_all(&self, id: FileId) {
        for version in self.driver.versions(id) {
            self.keep_alive(id, version);
        }
    }

    pub fn contains(&self, id: FileId, version: u64) -> bool {
        self.keep_alive(id, version);
        self.driver.contains(id, version)
    }

    pub fn contains_any(&self, id: FileId) -> bool {
        self.keep_alive_all(id);
        self.driver.contains_any(id)
    }

    pub async fn reader(&self, id: FileId, version: u64) -> Result<PayloadReader> {
        self.keep_alive(id, version);
        self.driver.reader(id, version).await
    }

    pub async fn writer(
        &self,
        id: FileId,
        old_version: u64,
        new_version: u64,
        truncate: bool,
    ) -> Result<PayloadWriter> {
        self.keep_alive(id, new_version);
        self.driver.writer(id, old_version, new_version, truncate).await
    }

    pub async fn open_pair(
        &self,
        id: FileId,
        old_version: u64,
        new_version: u64,
        truncate: bool,
    ) -> Result<(PayloadReader, PayloadWriter)> {
        self.keep_alive(id, new_version);
        self.driver
            .open_pair(id, old_version, new_version, truncate)
            .await
    }

    pub async fn size(&self, id: FileId, version: u64) -> u64 {
        self.keep_alive(id, version);
        self.driver.size(id, version).await
    }

    pub async fn remove(&self, id: FileId, version: u64) {
        self.deadlines.remove(&(id, version));
        self.driver.remove(id, version).await;
    }

    async fn sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let expired: Vec<(FileId, u64)> = self
                .deadlines
                .iter()
                .filter(|entry| *entry.value() <= now)
                .map(|entry| *entry.key())
                .collect();
            for (id, version) in expired {
                debug!(id, version, "evicting expired cached payload");
                self.remove(id, version).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn cache(dir: &tempfile::TempDir) -> Arc<Cache> {
        let driver = Arc::new(DataDriver::open(dir.path().to_path_buf()).await.unwrap());
        Cache::new(driver)
    }

    async fn fill(cache: &Cache, id: FileId, version: u64, data: &[u8]) {
        let mut w = cache.writer(id, 0, version, true).await.unwrap();
        w.write(data).await.unwrap();
        w.commit().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_untouched_payload_expires() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(&dir).await;
        fill(&c, 1, 1, b"cached").await;
        assert!(c.contains(1, 1));

        tokio::time::advance(EXPIRY + SWEEP_INTERVAL).await;
        // give the sweeper a chance to run its eviction
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(!c.driver.contains(1, 1));
        assert!(c.deadlines.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_resets_the_clock() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(&dir).await;
        fill(&c, 2, 1, b"busy").await;

        // keep touching it just before expiry
        for _ in 0..3 {
            tokio::time::advance(EXPIRY - Duration::from_secs(10)).await;
            tokio::task::yield_now().await;
            assert!(c.contains(2, 1));
        }
        assert!(c.driver.contains(2, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contains_any_refreshes_every_version() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(&dir).await;
        fill(&c, 3, 1, b"v1").await;
        fill(&c, 3, 2, b"v2").await;

        tokio::time::advance(EXPIRY - Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert!(c.contains_any(3));

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(c.driver.contains(3, 1));
        assert!(c.driver.contains(3, 2));
    }

    #[tokio::test]
    async fn test_remove_does_not_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(&dir).await;
        fill(&c, 4, 1, b"gone").await;
        c.remove(4, 1).await;
        assert!(!c.driver.contains(4, 1));
        assert!(!c.deadlines.contains_key(&(4, 1)));
    }
}
