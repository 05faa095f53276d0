use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::fs::errors::{Result, SporkError};
use crate::raft::entry::{LogEntry, LogOp};
use crate::raft::tracker::AckHandle;
use crate::raft::PROPOSAL_TIMEOUT;

/// A committed log entry handed to whoever must enforce it, together with
/// the tracker callback confirming the enforcement.
pub struct Commit {
    entry: LogEntry,
    ack: AckHandle,
}

impl Commit {
    pub(crate) fn new(entry: LogEntry, ack: AckHandle) -> Self {
        Commit { entry, ack }
    }

    pub fn entry(&self) -> &LogEntry {
        &self.entry
    }

    pub fn into_parts(self) -> (LogEntry, AckHandle) {
        (self.entry, self.ack)
    }

    /// Confirms the entry has been enforced. Also happens implicitly when
    /// the commit is dropped.
    pub fn ack(self) {
        self.ack.ack();
    }
}

/// Tracks in-flight proposals and routes committed entries either back to
/// their proposer or, for entries that originated elsewhere, into the
/// sync channel the apply loop consumes.
pub struct Applier {
    proposals: mpsc::Sender<Vec<u8>>,
    inflight: DashMap<u64, oneshot::Sender<Commit>>,
    shutdown: CancellationToken,
}

impl Applier {
    pub fn new(proposals: mpsc::Sender<Vec<u8>>, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Applier {
            proposals,
            inflight: DashMap::new(),
            shutdown,
        })
    }

    /// Consumes the commits stream from the raft node. Runs until the node
    /// closes the channel, then fails all pending proposers. Owning the
    /// sync sender here means the apply loop sees end-of-stream as soon as
    /// the watcher stops.
    pub async fn watch_commits(
        self: Arc<Self>,
        mut commits: mpsc::Receiver<Commit>,
        sync_tx: mpsc::Sender<Commit>,
    ) {
        while let Some(commit) = commits.recv().await {
            let req_id = commit.entry().req_id;
            match self.inflight.remove(&req_id) {
                Some((_, proposer)) => {
                    debug!(req_id, "routing committed entry to its proposer");
                    if let Err(commit) = proposer.send(commit) {
                        // proposer timed out in the meantime; the entry must
                        // still be enforced locally
                        if sync_tx.send(commit).await.is_err() {
                            break;
                        }
                    }
                }
                None => {
                    debug!(req_id, "queueing enforcement of foreign entry");
                    if sync_tx.send(commit).await.is_err() {
                        break;
                    }
                }
            }
        }

        debug!("commit stream closed, failing pending proposals");
        self.inflight.clear();
    }

    /// Proposes `op` and waits for it to commit. The election timeout bounds
    /// both the hand-off to the raft node and the wait for the commit.
    pub async fn propose(&self, op: LogOp) -> Result<Commit> {
        let (tx, rx) = oneshot::channel();
        let req_id = self.register(tx);
        let entry = LogEntry { req_id, op };
        let data = entry.encode()?;

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                self.inflight.remove(&req_id);
                return Err(SporkError::ConsensusUnavailable);
            }
            sent = timeout(PROPOSAL_TIMEOUT, self.proposals.send(data)) => {
                if !matches!(sent, Ok(Ok(()))) {
                    self.inflight.remove(&req_id);
                    return Err(SporkError::ConsensusUnavailable);
                }
            }
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                self.inflight.remove(&req_id);
                Err(SporkError::ConsensusUnavailable)
            }
            committed = timeout(PROPOSAL_TIMEOUT, rx) => match committed {
                Ok(Ok(commit)) => Ok(commit),
                Ok(Err(_)) => Err(SporkError::ConsensusUnavailable),
                Err(_) => {
                    warn!(req_id, "proposal timed out waiting for commit");
                    self.inflight.remove(&req_id);
                    Err(SporkError::ConsensusUnavailable)
                }
            }
        }
    }

    /// Picks a request id by rejection sampling against the in-flight map
    /// and registers the completion channel under it.
    fn register(&self, tx: oneshot::Sender<Commit>) -> u64 {
        let mut pending = Some(tx);
        loop {
            let req_id = rand::random::<u64>();
            if req_id == 0 {
                continue;
            }
            match self.inflight.entry(req_id) {
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    if let Some(tx) = pending.take() {
                        slot.insert(tx);
                    }
                    return req_id;
                }
            }
        }
    }
}
