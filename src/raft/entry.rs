use serde::{Deserialize, Serialize};

use crate::fs::errors::{Result, SporkError};
use crate::fs::file::{FileId, FileMode};

/// A replicated metadata operation. `req_id` is chosen by the proposing
/// peer's applier and lets it match the committed entry back to the waiting
/// proposer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub req_id: u64,
    pub op: LogOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogOp {
    Add {
        id: FileId,
        parent_id: FileId,
        name: String,
        mode: FileMode,
    },
    Rename {
        id: FileId,
        old_parent_id: FileId,
        old_name: String,
        new_parent_id: FileId,
        new_name: String,
    },
    Delete {
        id: FileId,
        parent_id: FileId,
        name: String,
    },
    Change {
        id: FileId,
        version: u64,
        offset: u64,
        size: u64,
        /// Raft id of the proposer; peers stream the new payload from it.
        peer_id: u64,
    },
}

impl LogEntry {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| SporkError::Corruption(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| SporkError::Corruption(e.to_string()))
    }
}
