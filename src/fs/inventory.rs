use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fs::errors::{Result, SporkError};
use crate::fs::file::{File, FileId, FileMode, FileRef, PayloadLock, Timestamp, ROOT_ID};
use crate::raft::snapshot::StateSource;

/// Authoritative in-memory view of the directory tree plus an id→links map
/// giving O(1) access by id and letting us enumerate hard links.
pub struct Inventory {
    root: RwLock<FileRef>,
    catalog: RwLock<HashMap<FileId, Vec<FileRef>>>,
}

impl Inventory {
    pub fn new() -> Self {
        let root = File::create(ROOT_ID, "", FileMode::directory());
        let mut catalog = HashMap::new();
        catalog.insert(ROOT_ID, vec![root.clone()]);
        Inventory {
            root: RwLock::new(root),
            catalog: RwLock::new(catalog),
        }
    }

    pub fn root(&self) -> FileRef {
        self.root.read().expect("inventory root poisoned").clone()
    }

    /// Any link of `id`. Sufficient when only the shared attributes matter.
    pub fn get_any(&self, id: FileId) -> Result<FileRef> {
        self.catalog
            .read()
            .expect("inventory catalog poisoned")
            .get(&id)
            .and_then(|links| links.first())
            .cloned()
            .ok_or(SporkError::NoSuchFile)
    }

    pub fn get_all(&self, id: FileId) -> Vec<FileRef> {
        self.catalog
            .read()
            .expect("inventory catalog poisoned")
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// The link of `id` living under `parent_id` as `name`. Needed whenever
    /// the operation targets one specific link of a multiply-linked file.
    pub fn get_specific(&self, id: FileId, parent_id: FileId, name: &str) -> Result<FileRef> {
        self.catalog
            .read()
            .expect("inventory catalog poisoned")
            .get(&id)
            .and_then(|links| {
                links
                    .iter()
                    .find(|l| l.parent() == Some(parent_id) && l.name() == name)
            })
            .cloned()
            .ok_or(SporkError::NoSuchFile)
    }

    pub fn contains(&self, id: FileId) -> bool {
        self.catalog
            .read()
            .expect("inventory catalog poisoned")
            .contains_key(&id)
    }

    pub fn add(&self, file: FileRef) {
        self.catalog
            .write()
            .expect("inventory catalog poisoned")
            .entry(file.id)
            .or_default()
            .push(file);
    }

    /// Unlinks one specific record. Returns true iff other links of the same
    /// id survive; the id leaves the map only when its last link goes.
    pub fn remove(&self, file: &FileRef) -> bool {
        let mut catalog = self.catalog.write().expect("inventory catalog poisoned");
        let Some(links) = catalog.get_mut(&file.id) else {
            return false;
        };
        links.retain(|l| !Arc::ptr_eq(l, file));
        if links.is_empty() {
            catalog.remove(&file.id);
            false
        } else {
            true
        }
    }

    /// Allocates an id unique among all currently known files.
    pub fn new_id(&self) -> FileId {
        let catalog = self.catalog.read().expect("inventory catalog poisoned");
        loop {
            let id = rand::random::<u64>();
            if id != ROOT_ID && !catalog.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn lock_for(&self, id: FileId) -> Option<PayloadLock> {
        self.catalog
            .read()
            .expect("inventory catalog poisoned")
            .get(&id)
            .and_then(|links| links.first())
            .map(|l| l.lock.clone())
    }

    pub fn set_version(&self, id: FileId, version: u64) {
        for link in self.get_all(id) {
            link.set_version(version);
        }
    }

    pub fn set_size(&self, id: FileId, size: u64) {
        for link in self.get_all(id) {
            link.set_size(size);
        }
    }

    pub fn set_times(&self, id: FileId, mtime: Timestamp, atime: Timestamp) {
        for link in self.get_all(id) {
            link.set_times(mtime, atime);
        }
    }

    /// Tree snapshot. Back-references and locks are not serialized; both are
    /// reconstructed on deserialize.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let node = snapshot_node(&self.root());
        bincode::serialize(&node).map_err(|e| SporkError::Corruption(e.to_string()))
    }

    /// Rebuilds the tree and the id map from a snapshot, installing a single
    /// lock object per id shared by all of its links.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<()> {
        let node: Node =
            bincode::deserialize(bytes).map_err(|e| SporkError::Corruption(e.to_string()))?;

        let mut locks: HashMap<FileId, PayloadLock> = HashMap::new();
        let mut catalog: HashMap<FileId, Vec<FileRef>> = HashMap::new();
        let root = rebuild(&node, None, &mut locks, &mut catalog);

        *self.root.write().expect("inventory root poisoned") = root;
        *self.catalog.write().expect("inventory catalog poisoned") = catalog;
        debug!(files = locks.len(), "restored inventory snapshot");
        Ok(())
    }
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSource for Inventory {
    fn name(&self) -> &'static str {
        "inventory"
    }

    fn state(&self) -> Result<Vec<u8>> {
        self.serialize()
    }

    fn restore(&self, bytes: &[u8]) -> Result<()> {
        self.deserialize(bytes)
    }
}

#[derive(Serialize, Deserialize)]
struct Node {
    id: FileId,
    name: String,
    mode: FileMode,
    size: u64,
    version: u64,
    atime: Timestamp,
    mtime: Timestamp,
    children: Vec<Node>,
}

fn snapshot_node(file: &FileRef) -> Node {
    Node {
        id: file.id,
        name: file.name(),
        mode: file.mode,
        size: file.size(),
        version: file.version(),
        atime: file.atime(),
        mtime: file.mtime(),
        children: file.list_children().iter().map(snapshot_node).collect(),
    }
}

fn rebuild(
    node: &Node,
    parent: Option<FileId>,
    locks: &mut HashMap<FileId, PayloadLock>,
    catalog: &mut HashMap<FileId, Vec<FileRef>>,
) -> FileRef {
    let lock = locks
        .entry(node.id)
        .or_insert_with(|| Arc::new(tokio::sync::RwLock::new(())))
        .clone();

    let file = File::restore(
        node.id,
        node.name.clone(),
        node.mode,
        node.size,
        node.version,
        node.atime,
        node.mtime,
        parent,
        lock,
    );
    catalog.entry(node.id).or_default().push(file.clone());

    for child in &node.children {
        let child_ref = rebuild(child, Some(node.id), locks, catalog);
        file.push_child(child_ref);
    }
    file
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attach(inv: &Inventory, parent: &FileRef, file: FileRef) {
        file.set_parent(Some(parent.id));
        parent.push_child(file.clone());
        inv.add(file);
    }

    #[test]
    fn test_round_trip_preserves_tree() {
        let inv = Inventory::new();
        let root = inv.root();

        let dir = File::create(10, "docs", FileMode::directory());
        attach(&inv, &root, dir.clone());

        let file = File::create(11, "a.txt", FileMode::regular(0o644));
        file.set_version(4);
        file.set_size(17);
        attach(&inv, &dir, file.clone());

        let link = File::link_of(&file, "b.txt");
        attach(&inv, &root, link);

        let bytes = inv.serialize().unwrap();

        let restored = Inventory::new();
        restored.deserialize(&bytes).unwrap();

        let dir2 = restored.get_any(10).unwrap();
        assert_eq!(dir2.name(), "docs");
        assert_eq!(dir2.parent(), Some(ROOT_ID));

        let links = restored.get_all(11);
        assert_eq!(links.len(), 2);
        for l in &links {
            assert_eq!(l.version(), 4);
            assert_eq!(l.size(), 17);
        }
        // one lock object per id, shared by both links
        assert!(Arc::ptr_eq(&links[0].lock, &links[1].lock));

        let by_name = restored.get_specific(11, 10, "a.txt").unwrap();
        assert_eq!(by_name.name(), "a.txt");
        assert!(restored.get_specific(11, 10, "b.txt").is_err());
    }

    #[test]
    fn test_remove_keeps_id_until_last_link() {
        let inv = Inventory::new();
        let root = inv.root();
        let file = File::create(5, "x", FileMode::regular(0o644));
        attach(&inv, &root, file.clone());
        let link = File::link_of(&file, "y");
        attach(&inv, &root, link.clone());

        assert!(inv.remove(&file));
        assert!(inv.contains(5));
        assert!(!inv.remove(&link));
        assert!(!inv.contains(5));
    }

    #[test]
    fn test_new_id_never_collides() {
        let inv = Inventory::new();
        let root = inv.root();
        for _ in 0..64 {
            let id = inv.new_id();
            assert_ne!(id, ROOT_ID);
            assert!(!inv.contains(id));
            attach(&inv, &root, File::create(id, "f", FileMode::regular(0o600)));
        }
    }

    #[test]
    fn test_broadcast_setters_reach_all_links() {
        let inv = Inventory::new();
        let root = inv.root();
        let file = File::create(9, "x", FileMode::regular(0o644));
        attach(&inv, &root, file.clone());
        attach(&inv, &root, File::link_of(&file, "y"));

        inv.set_version(9, 2);
        inv.set_size(9, 100);
        for link in inv.get_all(9) {
            assert_eq!(link.version(), 2);
            assert_eq!(link.size(), 100);
        }
    }
}
