use std::collections::HashMap;
use std::sync::Arc;

use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfChange, Entry, EntryType, Message, MessageType, Snapshot};
use raft::{RawNode, SnapshotStatus, Storage as _};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::fs::errors::Result;
use crate::raft::applier::Commit;
use crate::raft::entry::LogEntry;
use crate::raft::peers::Peers;
use crate::raft::snapshot::Snapshotter;
use crate::raft::storage::DiskStorage;
use crate::raft::tracker::EntryTracker;
use crate::raft::BCAST;
use crate::rpc::client::PeerClient;

/// How far the log may grow past the snapshot before we take a new one.
const SNAPSHOT_THRESHOLD: u64 = 1024;

/// Single-owner task around the consensus core. All communication with the
/// rest of the system goes through channels: serialized proposals in,
/// committed entries (wrapped with tracker callbacks) out, raw peer
/// messages in through the transport.
pub(crate) struct RaftNode {
    raw: RawNode<DiskStorage>,
    peers: Arc<Peers>,
    clients: HashMap<u64, PeerClient>,
    snapshotter: Snapshotter,
    tracker: Arc<EntryTracker>,

    proposals: mpsc::Receiver<Vec<u8>>,
    inbound: mpsc::Receiver<Message>,
    commits: mpsc::Sender<Commit>,
    shutdown: CancellationToken,

    applied_index: u64,
}

impl RaftNode {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        peers: Arc<Peers>,
        storage: DiskStorage,
        snapshotter: Snapshotter,
        tracker: Arc<EntryTracker>,
        proposals: mpsc::Receiver<Vec<u8>>,
        inbound: mpsc::Receiver<Message>,
        commits: mpsc::Sender<Commit>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let config = raft::Config {
            id: peers.this_raft_id(),
            election_tick: crate::raft::ELECTION_TICKS,
            heartbeat_tick: crate::raft::HEARTBEAT_TICKS,
            max_size_per_msg: u64::MAX,
            max_inflight_msgs: 256,
            ..Default::default()
        };
        config
            .validate()
            .map_err(|e| crate::fs::errors::SporkError::Corruption(e.to_string()))?;

        let raw = RawNode::with_default_logger(&config, storage)
            .map_err(|e| crate::fs::errors::SporkError::Corruption(e.to_string()))?;

        let mut clients = HashMap::new();
        for (i, addr) in peers.addresses().enumerate() {
            let raft_id = i as u64 + 1;
            if raft_id == peers.this_raft_id() {
                continue;
            }
            clients.insert(raft_id, PeerClient::connect_lazy(addr)?);
        }

        Ok(RaftNode {
            raw,
            peers,
            clients,
            snapshotter,
            tracker,
            proposals,
            inbound,
            commits,
            shutdown,
            applied_index: 0,
        })
    }

    pub(crate) async fn run(mut self) {
        info!(id = self.peers.this_raft_id(), "raft node started");
        let mut ticker = tokio::time::interval(BCAST);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.raw.tick();
                }
                proposal = self.proposals.recv() => {
                    match proposal {
                        Some(data) => {
                            if let Err(e) = self.raw.propose(vec![], data) {
                                warn!("proposing entry: {e}");
                            }
                        }
                        None => break,
                    }
                }
                message = self.inbound.recv() => {
                    match message {
                        Some(msg) => {
                            if let Err(e) = self.raw.step(msg) {
                                warn!("stepping raft message: {e}");
                            }
                        }
                        None => break,
                    }
                }
            }

            if self.raw.has_ready() {
                self.handle_ready().await;
            }
            self.maybe_create_snapshot().await;
        }
        info!("raft node stopped");
    }

    async fn handle_ready(&mut self) {
        let mut ready = self.raw.ready();

        if !ready.messages().is_empty() {
            let messages = ready.take_messages();
            self.send_messages(messages).await;
        }

        if ready.snapshot().get_metadata().get_index() > 0 {
            let snapshot = ready.snapshot().clone();
            self.install_snapshot(snapshot);
        }

        for entry in ready.take_committed_entries() {
            self.process_committed(entry).await;
        }

        if !ready.entries().is_empty() {
            if let Err(e) = self.raw.store().append(ready.entries()) {
                error!("appending raft entries: {e}");
            }
        }

        if let Some(hs) = ready.hs() {
            if let Err(e) = self.raw.store().set_hard_state(hs.clone()) {
                error!("saving hard state: {e}");
            }
        }

        if !ready.persisted_messages().is_empty() {
            let messages = ready.take_persisted_messages();
            self.send_messages(messages).await;
        }

        let mut light = self.raw.advance(ready);
        if let Some(commit) = light.commit_index() {
            if let Err(e) = self.raw.store().set_commit(commit) {
                error!("saving commit index: {e}");
            }
        }
        if !light.messages().is_empty() {
            let messages = light.take_messages();
            self.send_messages(messages).await;
        }
        for entry in light.take_committed_entries() {
            self.process_committed(entry).await;
        }
        self.raw.advance_apply();
    }

    /// Dispatches outbound messages concurrently, each with its own
    /// deadline. A snapshot message reports its outcome back to the core.
    async fn send_messages(&mut self, messages: Vec<Message>) {
        let mut sends = Vec::with_capacity(messages.len());
        for message in messages {
            let to = message.get_to();
            let is_snapshot = message.get_msg_type() == MessageType::MsgSnapshot;
            let Some(client) = self.clients.get(&to).cloned() else {
                error!(to, "no transport for raft peer");
                continue;
            };
            sends.push(async move {
                let outcome = client.step(message).await;
                (to, is_snapshot, outcome)
            });
        }

        for (to, is_snapshot, outcome) in futures::future::join_all(sends).await {
            if let Err(e) = &outcome {
                debug!(to, "sending raft message: {e}");
            }
            if is_snapshot {
                let status = if outcome.is_ok() {
                    SnapshotStatus::Finish
                } else {
                    SnapshotStatus::Failure
                };
                self.raw.report_snapshot(to, status);
            }
        }
    }

    /// Serializes each committed entry through the tracker so entry N+1 is
    /// not handed over before entry N has been fully enforced.
    async fn process_committed(&mut self, entry: Entry) {
        let index = entry.get_index();

        if entry.get_data().is_empty() {
            // the empty entry a fresh leader appends
            self.applied_index = index;
            return;
        }

        match entry.get_entry_type() {
            EntryType::EntryConfChange => {
                match ConfChange::parse_from_bytes(entry.get_data()) {
                    Ok(cc) => {
                        if let Err(e) = self.raw.apply_conf_change(&cc) {
                            warn!("applying conf change: {e}");
                        }
                    }
                    Err(e) => error!("undecodable conf change entry: {e}"),
                }
            }
            EntryType::EntryNormal => match LogEntry::decode(entry.get_data()) {
                Ok(log_entry) => {
                    self.tracker.wait().await;
                    let ack = self.tracker.watch(index).await;
                    debug!(index, "processing committed raft entry");
                    if self.commits.send(Commit::new(log_entry, ack)).await.is_err() {
                        warn!("commit consumer is gone, dropping entry");
                    }
                }
                Err(e) => error!(index, "undecodable committed entry: {e}"),
            },
            _ => {}
        }
        self.applied_index = index;
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) {
        let index = snapshot.get_metadata().get_index();
        let data = snapshot.get_data().to_vec();
        if let Err(e) = self.raw.store().apply_snapshot(snapshot) {
            error!("storing received snapshot: {e}");
            return;
        }
        // An archive naming an unknown state source means this peer runs an
        // incompatible build; continuing would silently fork the cluster.
        self.snapshotter
            .restore(&data)
            .expect("recovering snapshot state sources");
        self.applied_index = index;
    }

    /// Takes a snapshot of the registered state sources once the log has
    /// outgrown the threshold, quiescing apply for the duration.
    async fn maybe_create_snapshot(&mut self) {
        let store = self.raw.store();
        let (Ok(first), Ok(last)) = (store.first_index(), store.last_index()) else {
            return;
        };
        if last.saturating_sub(first) < SNAPSHOT_THRESHOLD || self.applied_index < first {
            return;
        }

        self.tracker.pause();
        self.tracker.wait().await;
        let result = self
            .snapshotter
            .create()
            .and_then(|data| {
                self.raw
                    .store()
                    .save_snapshot(self.applied_index, data, self.peers.conf_state())
            });
        self.tracker.resume();

        match result {
            Ok(()) => debug!(index = self.applied_index, "took periodic snapshot"),
            Err(e) => error!("creating snapshot: {e}"),
        }
    }
}
