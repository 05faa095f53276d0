use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::fs::errors::{Result, SporkError};

/// A serializable subsystem whose bytes travel inside consensus snapshots.
/// The inventory is currently the only registered source.
pub trait StateSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// A self-contained copy of the current state. Later mutations must not
    /// affect the returned bytes.
    fn state(&self) -> Result<Vec<u8>>;

    fn restore(&self, bytes: &[u8]) -> Result<()>;
}

/// Bundles registered state sources into a single snapshot archive and
/// recovers them from one.
pub struct Snapshotter {
    sources: BTreeMap<&'static str, Arc<dyn StateSource>>,
}

impl Snapshotter {
    pub fn new(sources: Vec<Arc<dyn StateSource>>) -> Result<Self> {
        let mut map: BTreeMap<&'static str, Arc<dyn StateSource>> = BTreeMap::new();
        for source in sources {
            if map.insert(source.name(), source.clone()).is_some() {
                return Err(SporkError::Corruption(format!(
                    "multiple state sources named {}",
                    source.name()
                )));
            }
        }
        Ok(Snapshotter { sources: map })
    }

    pub fn create(&self) -> Result<Vec<u8>> {
        debug!("creating consensus snapshot");
        let mut archive: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for (name, source) in &self.sources {
            archive.insert(name.to_string(), source.state()?);
        }
        bincode::serialize(&archive).map_err(|e| SporkError::Corruption(e.to_string()))
    }

    /// A snapshot naming a state source unknown to this build is fatal: it
    /// means the cluster runs an incompatible peer.
    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        let archive: BTreeMap<String, Vec<u8>> =
            bincode::deserialize(bytes).map_err(|e| SporkError::Corruption(e.to_string()))?;
        for (name, state) in archive {
            let source = self.sources.get(name.as_str()).ok_or_else(|| {
                SporkError::Corruption(format!("snapshot names unknown state source {name}"))
            })?;
            source.restore(&state)?;
        }
        Ok(())
    }
}
