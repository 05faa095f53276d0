use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub type FileId = u64;

pub const ROOT_ID: FileId = 0;

pub type FileRef = Arc<File>;

/// Reader-writer lock guarding a file's payload and version. One lock object
/// exists per id; every hard link of that id holds the same `Arc`, so taking
/// the lock through any link serializes against all of them.
pub type PayloadLock = Arc<tokio::sync::RwLock<()>>;

/// Payload versions carry a monotonically increasing generation in the high
/// bits and a tag naming the writing peer in the low bits. Two peers racing
/// from the same generation therefore always produce distinct versions, so
/// their payloads can never collide on one `(id, version)` key and a fetch
/// by version is never ambiguous. Version 0 stays the "no payload" sentinel.
pub const VERSION_TAG_BITS: u32 = 16;

pub fn version_generation(version: u64) -> u64 {
    version >> VERSION_TAG_BITS
}

/// The version a writer advances to from `current`. `writer_tag` is the
/// proposing peer's raft id; it must fit the tag bits, which the peer list
/// guarantees at startup.
pub fn next_version(current: u64, writer_tag: u64) -> u64 {
    ((version_generation(current) + 1) << VERSION_TAG_BITS)
        | (writer_tag & ((1 << VERSION_TAG_BITS) - 1))
}

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMode(pub u32);

impl FileMode {
    pub fn directory() -> Self {
        FileMode(S_IFDIR | 0o755)
    }

    pub fn regular(perm: u32) -> Self {
        FileMode(S_IFREG | (perm & 0o7777))
    }

    pub fn is_dir(self) -> bool {
        self.0 & S_IFMT == S_IFDIR
    }

    pub fn is_regular(self) -> bool {
        self.0 & S_IFMT == S_IFREG
    }

    pub fn perm(self) -> u32 {
        self.0 & 0o7777
    }
}

impl std::fmt::Display for FileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#o}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: now.as_secs(),
            nanoseconds: now.subsec_nanos(),
        }
    }
}

#[derive(Debug, Clone)]
struct Attrs {
    name: String,
    size: u64,
    version: u64,
    atime: Timestamp,
    mtime: Timestamp,
    parent: Option<FileId>,
}

/// One hard link of a file. Links of the same id share `mode`, `lock`,
/// `version`, `size` and times; they differ in `name` and `parent`.
///
/// The field guards below are plain `std` locks and are never held across an
/// await point; the `lock` member is the long-held payload lock.
pub struct File {
    pub id: FileId,
    pub mode: FileMode,
    pub lock: PayloadLock,
    attrs: RwLock<Attrs>,
    children: RwLock<Vec<FileRef>>,
}

impl File {
    /// A brand-new file with a fresh payload lock and version 0.
    pub fn create(id: FileId, name: &str, mode: FileMode) -> FileRef {
        let now = Timestamp::now();
        Arc::new(File {
            id,
            mode,
            lock: Arc::new(tokio::sync::RwLock::new(())),
            attrs: RwLock::new(Attrs {
                name: name.to_string(),
                size: 0,
                version: 0,
                atime: now,
                mtime: now,
                parent: None,
            }),
            children: RwLock::new(Vec::new()),
        })
    }

    /// A new link of `existing`: shares id, mode, payload lock, version,
    /// size and times, but carries its own name and (unset) parent.
    pub fn link_of(existing: &File, name: &str) -> FileRef {
        let attrs = existing.attrs.read().expect("file attrs poisoned");
        Arc::new(File {
            id: existing.id,
            mode: existing.mode,
            lock: existing.lock.clone(),
            attrs: RwLock::new(Attrs {
                name: name.to_string(),
                size: attrs.size,
                version: attrs.version,
                atime: attrs.atime,
                mtime: attrs.mtime,
                parent: None,
            }),
            children: RwLock::new(Vec::new()),
        })
    }

    /// Rebuilds a link record from serialized state, attaching the per-id
    /// lock object the inventory resolved for it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        id: FileId,
        name: String,
        mode: FileMode,
        size: u64,
        version: u64,
        atime: Timestamp,
        mtime: Timestamp,
        parent: Option<FileId>,
        lock: PayloadLock,
    ) -> FileRef {
        Arc::new(File {
            id,
            mode,
            lock,
            attrs: RwLock::new(Attrs {
                name,
                size,
                version,
                atime,
                mtime,
                parent,
            }),
            children: RwLock::new(Vec::new()),
        })
    }

    fn attrs(&self) -> std::sync::RwLockReadGuard<'_, Attrs> {
        self.attrs.read().expect("file attrs poisoned")
    }

    fn attrs_mut(&self) -> std::sync::RwLockWriteGuard<'_, Attrs> {
        self.attrs.write().expect("file attrs poisoned")
    }

    pub fn name(&self) -> String {
        self.attrs().name.clone()
    }

    pub fn set_name(&self, name: &str) {
        self.attrs_mut().name = name.to_string();
    }

    pub fn size(&self) -> u64 {
        self.attrs().size
    }

    pub fn set_size(&self, size: u64) {
        self.attrs_mut().size = size;
    }

    pub fn version(&self) -> u64 {
        self.attrs().version
    }

    pub fn set_version(&self, version: u64) {
        self.attrs_mut().version = version;
    }

    pub fn atime(&self) -> Timestamp {
        self.attrs().atime
    }

    pub fn mtime(&self) -> Timestamp {
        self.attrs().mtime
    }

    pub fn set_atime(&self, t: Timestamp) {
        self.attrs_mut().atime = t;
    }

    pub fn set_times(&self, mtime: Timestamp, atime: Timestamp) {
        let mut attrs = self.attrs_mut();
        attrs.mtime = mtime;
        attrs.atime = atime;
    }

    pub fn parent(&self) -> Option<FileId> {
        self.attrs().parent
    }

    pub fn set_parent(&self, parent: Option<FileId>) {
        self.attrs_mut().parent = parent;
    }

    fn children(&self) -> std::sync::RwLockReadGuard<'_, Vec<FileRef>> {
        self.children.read().expect("file children poisoned")
    }

    pub fn child_named(&self, name: &str) -> Option<FileRef> {
        self.children()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub fn list_children(&self) -> Vec<FileRef> {
        self.children().clone()
    }

    pub fn child_count(&self) -> usize {
        self.children().len()
    }

    pub fn push_child(&self, child: FileRef) {
        self.children
            .write()
            .expect("file children poisoned")
            .push(child);
    }

    /// Detaches the child matching both id and name (links share ids, so the
    /// name is required to pick the right record). Returns the detached ref.
    pub fn remove_child(&self, id: FileId, name: &str) -> Option<FileRef> {
        let mut children = self.children.write().expect("file children poisoned");
        let pos = children
            .iter()
            .position(|c| c.id == id && c.name() == name)?;
        Some(children.remove(pos))
    }

    /// A point-in-time snapshot of this link, used for the invalidation and
    /// deletion channels so consumers see the pre-mutation view.
    pub fn view(&self) -> FileView {
        let attrs = self.attrs();
        FileView {
            id: self.id,
            name: attrs.name.clone(),
            mode: self.mode,
            size: attrs.size,
            version: attrs.version,
            atime: attrs.atime,
            mtime: attrs.mtime,
            parent: attrs.parent,
        }
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let attrs = self.attrs();
        f.debug_struct("File")
            .field("id", &self.id)
            .field("name", &attrs.name)
            .field("mode", &self.mode)
            .field("size", &attrs.size)
            .field("version", &attrs.version)
            .field("parent", &attrs.parent)
            .finish()
    }
}

/// Value snapshot of a link at the moment an event was emitted.
#[derive(Debug, Clone)]
pub struct FileView {
    pub id: FileId,
    pub name: String,
    pub mode: FileMode,
    pub size: u64,
    pub version: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub parent: Option<FileId>,
}
