pub mod applier;
pub mod entry;
pub mod node;
pub mod peers;
pub mod snapshot;
pub mod storage;
pub mod tracker;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use raft::eraftpb::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::fs::errors::Result;
use crate::fs::file::{FileId, FileMode};
use crate::raft::applier::{Applier, Commit};
use crate::raft::entry::LogOp;
use crate::raft::node::RaftNode;
use crate::raft::peers::Peers;
use crate::raft::snapshot::{Snapshotter, StateSource};
use crate::raft::storage::DiskStorage;
use crate::raft::tracker::EntryTracker;
use crate::task::spawn_named;

/// Usual time it takes to send a message and receive a reply; also the tick
/// period of the consensus state machine.
pub const BCAST: Duration = Duration::from_millis(10);
pub const HEARTBEAT_TICKS: usize = 5;
/// ~50 heartbeats, i.e. roughly 2.5 s.
pub const ELECTION_TICKS: usize = 250;
/// Deadline for a proposal round trip; enough for a full trip to a freshly
/// elected leader.
pub const PROPOSAL_TIMEOUT: Duration =
    Duration::from_millis(BCAST.as_millis() as u64 * ELECTION_TICKS as u64);
/// Per-message send deadline.
pub const SEND_TIMEOUT: Duration = Duration::from_millis(BCAST.as_millis() as u64 * 10);

/// Handle to this peer's consensus layer: proposals go in through the typed
/// methods, committed entries that must be enforced locally come out of the
/// sync channel returned by `start`.
pub struct Raft {
    applier: Arc<Applier>,
    peers: Arc<Peers>,
    shutdown: CancellationToken,
    node_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Raft {
    /// Boots the raft node over its durable storage and wires the applier.
    /// `inbound` carries raw peer messages from the transport.
    pub fn start(
        peers: Arc<Peers>,
        store_dir: &Path,
        sources: Vec<Arc<dyn StateSource>>,
        inbound: mpsc::Receiver<Message>,
        shutdown: CancellationToken,
    ) -> Result<(Arc<Raft>, mpsc::Receiver<Commit>)> {
        let storage = DiskStorage::open(store_dir, peers.conf_state())?;
        let snapshotter = Snapshotter::new(sources)?;
        // a locally persisted snapshot covers a log prefix the core will not
        // replay, so the state sources must be rebuilt from it before apply
        // starts
        if let Some(archive) = storage.snapshot_data() {
            snapshotter.restore(&archive)?;
        }
        let tracker = EntryTracker::new();

        let (proposals_tx, proposals_rx) = mpsc::channel(64);
        let (commits_tx, commits_rx) = mpsc::channel(64);
        let (sync_tx, sync_rx) = mpsc::channel(64);

        let node = RaftNode::new(
            peers.clone(),
            storage,
            snapshotter,
            tracker,
            proposals_rx,
            inbound,
            commits_tx,
            shutdown.clone(),
        )?;
        let node_task = spawn_named("raft-node", node.run());

        let applier = Applier::new(proposals_tx, shutdown.clone());
        spawn_named(
            "raft-applier",
            applier.clone().watch_commits(commits_rx, sync_tx),
        );

        let raft = Arc::new(Raft {
            applier,
            peers,
            shutdown,
            node_task: std::sync::Mutex::new(Some(node_task)),
        });
        Ok((raft, sync_rx))
    }

    pub async fn add(
        &self,
        id: FileId,
        parent_id: FileId,
        name: String,
        mode: FileMode,
    ) -> Result<Commit> {
        self.applier
            .propose(LogOp::Add {
                id,
                parent_id,
                name,
                mode,
            })
            .await
    }

    pub async fn change(&self, id: FileId, version: u64, size: u64) -> Result<Commit> {
        self.applier
            .propose(LogOp::Change {
                id,
                version,
                offset: 0,
                size,
                peer_id: self.peers.this_raft_id(),
            })
            .await
    }

    pub async fn rename(
        &self,
        id: FileId,
        old_parent_id: FileId,
        old_name: String,
        new_parent_id: FileId,
        new_name: String,
    ) -> Result<Commit> {
        self.applier
            .propose(LogOp::Rename {
                id,
                old_parent_id,
                old_name,
                new_parent_id,
                new_name,
            })
            .await
    }

    pub async fn delete(&self, id: FileId, parent_id: FileId, name: String) -> Result<Commit> {
        self.applier
            .propose(LogOp::Delete {
                id,
                parent_id,
                name,
            })
            .await
    }

    pub async fn shutdown(&self) {
        info!("stopping raft");
        self.shutdown.cancel();
        let task = self.node_task.lock().expect("raft task slot poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("stopped raft");
    }
}
