#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use tempfile::TempDir;
    use tokio::net::TcpListener;

    use crate::config::{PeerSettings, Settings};
    use crate::fs::errors::SporkError;
    use crate::fs::file::{FileMode, FileRef};
    use crate::fs::Spork;
    use crate::Instance;

    const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(60);
    const RETRY_PAUSE: Duration = Duration::from_millis(500);

    struct TestCluster {
        instances: Vec<Option<Instance>>,
        settings: Vec<Settings>,
        _dirs: Vec<TempDir>,
    }

    impl TestCluster {
        async fn start(n: usize, redundancy: usize) -> Self {
            let mut addrs = Vec::with_capacity(n);
            for _ in 0..n {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                addrs.push(listener.local_addr().unwrap().to_string());
                drop(listener);
            }

            let mut dirs = Vec::with_capacity(n);
            let mut settings = Vec::with_capacity(n);
            let mut instances = Vec::with_capacity(n);
            for addr in &addrs {
                let dir = tempfile::tempdir().unwrap();
                let cfg = Settings {
                    data_dir: dir.path().to_path_buf(),
                    mount_point: PathBuf::from("/unused"),
                    peers: PeerSettings {
                        all_peers: addrs.clone(),
                        this_peer: addr.clone(),
                        redundancy,
                        data_dir: dir.path().join("raft"),
                    },
                };
                instances.push(Some(Instance::start(&cfg).await.unwrap()));
                settings.push(cfg);
                dirs.push(dir);
            }
            TestCluster {
                instances,
                settings,
                _dirs: dirs,
            }
        }

        fn spork(&self, i: usize) -> Arc<Spork> {
            self.instances[i]
                .as_ref()
                .expect("peer is stopped")
                .spork
                .clone()
        }

        fn running(&self) -> Vec<Arc<Spork>> {
            self.instances
                .iter()
                .flatten()
                .map(|instance| instance.spork.clone())
                .collect()
        }

        async fn stop(&mut self, i: usize) {
            if let Some(instance) = self.instances[i].take() {
                instance.stop().await;
            }
        }

        async fn restart(&mut self, i: usize) {
            assert!(self.instances[i].is_none(), "peer {i} is still running");
            self.instances[i] = Some(Instance::start(&self.settings[i]).await.unwrap());
        }

        async fn stop_all(mut self) {
            for i in 0..self.instances.len() {
                self.stop(i).await;
            }
        }
    }

    async fn eventually<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + CONVERGENCE_TIMEOUT;
        loop {
            if check().await {
                return;
            }
            if Instant::now() > deadline {
                panic!("timed out waiting for: {what}");
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Waits until every running peer reads `expected` back under `name`.
    async fn assert_converges(cluster: &TestCluster, name: &str, expected: &[u8]) {
        let sporks = cluster.running();
        let name = name.to_string();
        let expected = expected.to_vec();
        eventually("all peers read the expected content", move || {
            let sporks = sporks.clone();
            let name = name.clone();
            let expected = expected.clone();
            async move {
                for spork in &sporks {
                    if read_by_name(spork, &name).await.as_deref() != Some(&expected[..]) {
                        return false;
                    }
                }
                true
            }
        })
        .await;
    }

    /// Creates a file, riding out leader elections. An earlier attempt that
    /// timed out waiting for its commit may still land, so "already exists"
    /// counts as success.
    async fn create_file(spork: &Arc<Spork>, name: &str) -> FileRef {
        let root = spork.root();
        let deadline = Instant::now() + CONVERGENCE_TIMEOUT;
        loop {
            match spork
                .create_file(&root, name, FileMode::regular(0o666))
                .await
            {
                Ok(file) => return file,
                Err(SporkError::FileAlreadyExists) => {
                    return spork.lookup(&root, name).await.unwrap();
                }
                Err(SporkError::ConsensusUnavailable) => {
                    assert!(
                        Instant::now() < deadline,
                        "consensus never became available for create"
                    );
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
                Err(e) => panic!("creating {name}: {e}"),
            }
        }
    }

    async fn write_file(spork: &Arc<Spork>, file: &FileRef, content: &[u8]) {
        let deadline = Instant::now() + CONVERGENCE_TIMEOUT;
        loop {
            assert!(
                Instant::now() < deadline,
                "consensus never became available for write"
            );
            let mut writer = match spork.open_write(file, true).await {
                Ok(w) => w,
                Err(_) => {
                    tokio::time::sleep(RETRY_PAUSE).await;
                    continue;
                }
            };
            if writer.write(content).await.is_err() {
                tokio::time::sleep(RETRY_PAUSE).await;
                continue;
            }
            match writer.close().await {
                Ok(()) => return,
                Err(SporkError::ConsensusUnavailable) | Err(SporkError::StaleHandle) => {
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
                Err(e) => panic!("writing: {e}"),
            }
        }
    }

    async fn read_by_name(spork: &Arc<Spork>, name: &str) -> Option<Vec<u8>> {
        let root = spork.root();
        let file = spork.lookup(&root, name).await.ok()?;
        spork.read(&file, 0, 1024).await.ok()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_create_empty_file_visible_on_all_peers() {
        let cluster = TestCluster::start(3, 2).await;

        let file = create_file(&cluster.spork(1), "a.txt").await;
        assert_eq!(file.size(), 0);

        let sporks = cluster.running();
        let id = file.id;
        eventually("a.txt exists with size 0 on every peer", move || {
            let sporks = sporks.clone();
            async move {
                for spork in &sporks {
                    let root = spork.root();
                    match spork.lookup(&root, "a.txt").await {
                        Ok(found) if found.id == id && found.size() == 0 => {}
                        _ => return false,
                    }
                }
                true
            }
        })
        .await;

        cluster.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_write_then_read_everywhere() {
        let cluster = TestCluster::start(3, 2).await;
        let content = b"hope this works!\n";

        let file = create_file(&cluster.spork(0), "b.txt").await;
        write_file(&cluster.spork(0), &file, content).await;

        assert_converges(&cluster, "b.txt", content).await;
        cluster.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_delete_removes_everywhere() {
        let cluster = TestCluster::start(3, 2).await;

        create_file(&cluster.spork(1), "c.txt").await;
        assert_converges(&cluster, "c.txt", b"").await;

        // delete from a different peer than the creator
        let deleter = cluster.spork(2);
        let deadline = Instant::now() + CONVERGENCE_TIMEOUT;
        loop {
            let root = deleter.root();
            let target = match deleter.lookup(&root, "c.txt").await {
                Ok(f) => f,
                Err(_) => break, // already gone
            };
            match deleter.delete(&target).await {
                Ok(()) => break,
                Err(SporkError::ConsensusUnavailable) => {
                    assert!(Instant::now() < deadline, "delete never committed");
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
                Err(SporkError::NoSuchFile) => break,
                Err(e) => panic!("deleting: {e}"),
            }
        }

        let sporks = cluster.running();
        eventually("c.txt is gone from every peer", move || {
            let sporks = sporks.clone();
            async move {
                for spork in &sporks {
                    let root = spork.root();
                    if spork.lookup(&root, "c.txt").await.is_ok() {
                        return false;
                    }
                }
                true
            }
        })
        .await;

        cluster.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rename_moves_the_entry() {
        let cluster = TestCluster::start(3, 2).await;

        create_file(&cluster.spork(0), "d.txt").await;
        assert_converges(&cluster, "d.txt", b"").await;

        let renamer = cluster.spork(1);
        let deadline = Instant::now() + CONVERGENCE_TIMEOUT;
        loop {
            let root = renamer.root();
            let target = match renamer.lookup(&root, "d.txt").await {
                Ok(f) => f,
                Err(_) => break, // a prior timed-out attempt landed
            };
            match renamer.rename(&target, &root, &root, "e.txt").await {
                Ok(()) => break,
                Err(SporkError::ConsensusUnavailable) => {
                    assert!(Instant::now() < deadline, "rename never committed");
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
                Err(e) => panic!("renaming: {e}"),
            }
        }

        let sporks = cluster.running();
        eventually("e.txt present and d.txt absent everywhere", move || {
            let sporks = sporks.clone();
            async move {
                for spork in &sporks {
                    let root = spork.root();
                    if spork.lookup(&root, "e.txt").await.is_err() {
                        return false;
                    }
                    if spork.lookup(&root, "d.txt").await.is_ok() {
                        return false;
                    }
                }
                true
            }
        })
        .await;

        cluster.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_converge_on_one_value() {
        let cluster = TestCluster::start(3, 2).await;

        let file0 = create_file(&cluster.spork(0), "shared.txt").await;
        write_file(&cluster.spork(0), &file0, b"initial").await;
        assert_converges(&cluster, "shared.txt", b"initial").await;

        let spork0 = cluster.spork(0);
        let spork2 = cluster.spork(2);
        let file0 = spork0.lookup(&spork0.root(), "shared.txt").await.unwrap();
        let file2 = spork2.lookup(&spork2.root(), "shared.txt").await.unwrap();

        // both handles open before either closes, so they race from the
        // same starting version on their respective peers
        let mut w0 = spork0.open_write(&file0, true).await.unwrap();
        let mut w2 = spork2.open_write(&file2, true).await.unwrap();
        w2.write(b"hello").await.unwrap();
        w0.write(b"world").await.unwrap();

        // losing outcomes depend on timing: a stale handle when the other
        // change already applied locally, or a proposal timeout when the
        // close held the file lock the apply loop needed
        let (r0, r2) = tokio::join!(w0.close(), w2.close());
        for outcome in [&r0, &r2] {
            match outcome {
                Ok(())
                | Err(SporkError::StaleHandle)
                | Err(SporkError::ConsensusUnavailable) => {}
                Err(e) => panic!("unexpected close outcome: {e}"),
            }
        }

        // whichever change is later in the log wins on every peer alike
        let sporks = cluster.running();
        eventually("every peer reads the same single value", move || {
            let sporks = sporks.clone();
            async move {
                let mut seen: Option<Vec<u8>> = None;
                for spork in &sporks {
                    match read_by_name(spork, "shared.txt").await {
                        Some(data) if data == b"hello" || data == b"world" => match &seen {
                            None => seen = Some(data),
                            Some(prev) if *prev == data => {}
                            Some(_) => return false,
                        },
                        _ => return false,
                    }
                }
                true
            }
        })
        .await;

        cluster.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_minority_loss_still_accepts_writes() {
        let mut cluster = TestCluster::start(3, 2).await;

        // make sure the cluster is up before losing a peer
        create_file(&cluster.spork(0), "warmup.txt").await;

        cluster.stop(2).await;

        let file = create_file(&cluster.spork(0), "survivor.txt").await;
        write_file(&cluster.spork(0), &file, b"still here").await;

        assert_converges(&cluster, "survivor.txt", b"still here").await;
        cluster.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_restarted_peer_catches_up() {
        // full redundancy, so every peer must end up holding the payload
        let mut cluster = TestCluster::start(3, 3).await;

        let file = create_file(&cluster.spork(0), "healed.txt").await;
        write_file(&cluster.spork(0), &file, b"v1").await;
        assert_converges(&cluster, "healed.txt", b"v1").await;

        cluster.stop(1).await;

        let spork0 = cluster.spork(0);
        let file = spork0.lookup(&spork0.root(), "healed.txt").await.unwrap();
        write_file(&spork0, &file, b"v2 after the outage").await;

        cluster.restart(1).await;

        let healed = cluster.spork(1);
        eventually("restarted peer serves the new payload", move || {
            let healed = healed.clone();
            async move {
                read_by_name(&healed, "healed.txt").await.as_deref()
                    == Some(&b"v2 after the outage"[..])
            }
        })
        .await;

        cluster.stop_all().await;
    }
}
