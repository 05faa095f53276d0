use raft::eraftpb::ConfState;

use crate::fs::errors::{Result, SporkError};
use crate::fs::file::{FileId, VERSION_TAG_BITS};

/// Static sorted peer list plus the deterministic file→peers mapping.
///
/// The id space is split into `len()` equal slots; the slot an id falls into
/// picks the first home peer and the next `redundancy - 1` peers (wrapping)
/// complete the home set. Membership never changes at runtime, so the
/// mapping is stable for the life of the cluster.
pub struct Peers {
    peers: Vec<String>,
    this_index: usize,
    redundancy: usize,
    slots_per_peer: u64,
}

impl Peers {
    pub fn new(mut all_peers: Vec<String>, this_peer: &str, redundancy: usize) -> Result<Self> {
        if all_peers.is_empty() {
            return Err(SporkError::Corruption("empty peer list".to_string()));
        }
        if redundancy == 0 || redundancy > all_peers.len() {
            return Err(SporkError::Corruption(format!(
                "redundancy {} out of range for {} peers",
                redundancy,
                all_peers.len()
            )));
        }
        // raft ids double as writer tags inside payload versions
        if all_peers.len() >= 1 << VERSION_TAG_BITS {
            return Err(SporkError::Corruption(format!(
                "peer list of {} exceeds the writer tag space",
                all_peers.len()
            )));
        }
        all_peers.sort();
        all_peers.dedup();
        let this_index = all_peers
            .iter()
            .position(|p| p == this_peer)
            .ok_or_else(|| {
                SporkError::Corruption(format!("this peer {this_peer} is not in the peer list"))
            })?;
        let slots_per_peer = u64::MAX / all_peers.len() as u64;
        Ok(Peers {
            peers: all_peers,
            this_index,
            redundancy,
            slots_per_peer,
        })
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn this_addr(&self) -> &str {
        &self.peers[self.this_index]
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.peers.iter().map(String::as_str)
    }

    /// Raft node ids are 1-based positions in the sorted list; the raft
    /// crate rejects id 0.
    pub fn this_raft_id(&self) -> u64 {
        self.this_index as u64 + 1
    }

    pub fn addr_of_raft_id(&self, raft_id: u64) -> Option<&str> {
        raft_id
            .checked_sub(1)
            .and_then(|i| self.peers.get(i as usize))
            .map(String::as_str)
    }

    pub fn conf_state(&self) -> ConfState {
        let mut cs = ConfState::new();
        cs.set_voters((1..=self.peers.len() as u64).collect());
        cs
    }

    fn home_indices(&self, id: FileId) -> Vec<usize> {
        let n = self.peers.len() as u64;
        let base = id / self.slots_per_peer;
        (0..self.redundancy as u64)
            .map(|k| ((base + k) % n) as usize)
            .collect()
    }

    /// Whether this peer must durably store `id`'s payload.
    pub fn is_local(&self, id: FileId) -> bool {
        self.home_indices(id).contains(&self.this_index)
    }

    /// Home peers for `id`, excluding this peer.
    pub fn peers_with_file(&self, id: FileId) -> Vec<String> {
        self.home_indices(id)
            .into_iter()
            .filter(|&i| i != self.this_index)
            .map(|i| self.peers[i].clone())
            .collect()
    }
}
