//! Node model
//!
//! A `Node` is the engine's record of one filesystem or cloud item. Nodes
//! are immutable value objects: scan, diff, and executor logic produce new
//! records rather than mutating shared state in place. Diff categories are
//! tags kept by the diff engine, not node subtypes.

pub mod identifier;

use crate::device::{DeviceUid, Uid};
pub use identifier::NodeIdentifier;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trash state of a node. Anything other than `NotTrashed` is excluded from
/// diff matching unless the caller opts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrashStatus {
    NotTrashed = 0,
    ImplicitlyTrashed = 1,
    ExplicitlyTrashed = 2,
}

impl TrashStatus {
    pub fn is_trashed(&self) -> bool {
        !matches!(self, TrashStatus::NotTrashed)
    }

    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}

impl From<i32> for TrashStatus {
    fn from(value: i32) -> Self {
        match value {
            1 => TrashStatus::ImplicitlyTrashed,
            2 => TrashStatus::ExplicitlyTrashed,
            _ => TrashStatus::NotTrashed,
        }
    }
}

/// A regular file on either tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub identifier: NodeIdentifier,
    /// Local: exactly one entry. Cloud: one per parent.
    pub parent_uids: Vec<Uid>,
    pub size_bytes: u64,
    /// Primary content hash. None until computed (or uncomputable).
    pub md5: Option<String>,
    /// Optional secondary hash flavor.
    pub sha256: Option<String>,
    /// When the index last observed this node (epoch millis).
    pub sync_ts: i64,
    /// Content modification time (epoch millis).
    pub modify_ts: i64,
    /// Metadata change time (epoch millis).
    pub change_ts: i64,
    pub trashed: TrashStatus,
    /// False once the live tree no longer contains the node.
    pub live: bool,
    /// Provider-assigned id, for cloud nodes.
    pub external_id: Option<String>,
    /// Provider-assigned version, for cloud nodes.
    pub version: Option<i64>,
}

impl FileNode {
    pub fn uid(&self) -> Uid {
        self.identifier.uid
    }

    pub fn device_uid(&self) -> DeviceUid {
        self.identifier.device_uid
    }

    pub fn name(&self) -> &str {
        self.identifier.name()
    }

    /// Equal primary hash and equal size imply content equality.
    pub fn is_content_equal(&self, other: &FileNode) -> bool {
        match (&self.md5, &other.md5) {
            (Some(a), Some(b)) => a == b && self.size_bytes == other.size_bytes,
            _ => false,
        }
    }

    /// Metadata match used to decide whether a cached hash may be reused.
    pub fn meta_matches(&self, other: &FileNode) -> bool {
        self.size_bytes == other.size_bytes
            && self.modify_ts == other.modify_ts
            && self.change_ts == other.change_ts
    }
}

/// A directory on either tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirNode {
    pub identifier: NodeIdentifier,
    pub parent_uids: Vec<Uid>,
    pub trashed: TrashStatus,
    pub live: bool,
    /// True when the index is authoritative for this directory's children.
    pub all_children_fetched: bool,
    pub sync_ts: i64,
    /// Provider-assigned id, for cloud nodes.
    pub external_id: Option<String>,
}

impl DirNode {
    pub fn uid(&self) -> Uid {
        self.identifier.uid
    }
}

/// A node in either tree. Synthetic container nodes (tree roots, diff
/// category headers) are a presentation concern and are never represented
/// here nor persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    File(FileNode),
    Dir(DirNode),
}

impl Node {
    pub fn identifier(&self) -> &NodeIdentifier {
        match self {
            Node::File(f) => &f.identifier,
            Node::Dir(d) => &d.identifier,
        }
    }

    pub fn identifier_mut(&mut self) -> &mut NodeIdentifier {
        match self {
            Node::File(f) => &mut f.identifier,
            Node::Dir(d) => &mut d.identifier,
        }
    }

    pub fn uid(&self) -> Uid {
        self.identifier().uid
    }

    pub fn device_uid(&self) -> DeviceUid {
        self.identifier().device_uid
    }

    pub fn name(&self) -> &str {
        self.identifier().name()
    }

    pub fn single_path(&self) -> &str {
        self.identifier().single_path()
    }

    pub fn path_list(&self) -> &[String] {
        &self.identifier().path_list
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Dir(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Node::File(_))
    }

    pub fn is_live(&self) -> bool {
        match self {
            Node::File(f) => f.live,
            Node::Dir(d) => d.live,
        }
    }

    pub fn set_live(&mut self, live: bool) {
        match self {
            Node::File(f) => f.live = live,
            Node::Dir(d) => d.live = live,
        }
    }

    pub fn trashed(&self) -> TrashStatus {
        match self {
            Node::File(f) => f.trashed,
            Node::Dir(d) => d.trashed,
        }
    }

    pub fn set_trashed(&mut self, trashed: TrashStatus) {
        match self {
            Node::File(f) => f.trashed = trashed,
            Node::Dir(d) => d.trashed = trashed,
        }
    }

    pub fn parent_uids(&self) -> &[Uid] {
        match self {
            Node::File(f) => &f.parent_uids,
            Node::Dir(d) => &d.parent_uids,
        }
    }

    pub fn set_parent_uids(&mut self, parents: Vec<Uid>) {
        match self {
            Node::File(f) => f.parent_uids = parents,
            Node::Dir(d) => d.parent_uids = parents,
        }
    }

    pub fn first_parent_uid(&self) -> Option<Uid> {
        self.parent_uids().first().copied()
    }

    pub fn md5(&self) -> Option<&str> {
        match self {
            Node::File(f) => f.md5.as_deref(),
            Node::Dir(_) => None,
        }
    }

    pub fn sha256(&self) -> Option<&str> {
        match self {
            Node::File(f) => f.sha256.as_deref(),
            Node::Dir(_) => None,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        match self {
            Node::File(f) => f.size_bytes,
            Node::Dir(_) => 0,
        }
    }

    pub fn external_id(&self) -> Option<&str> {
        match self {
            Node::File(f) => f.external_id.as_deref(),
            Node::Dir(d) => d.external_id.as_deref(),
        }
    }

    pub fn sync_ts(&self) -> i64 {
        match self {
            Node::File(f) => f.sync_ts,
            Node::Dir(d) => d.sync_ts,
        }
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match self {
            Node::File(f) => Some(f),
            Node::Dir(_) => None,
        }
    }

    pub fn as_dir(&self) -> Option<&DirNode> {
        match self {
            Node::Dir(d) => Some(d),
            Node::File(_) => None,
        }
    }

    /// Equality ignoring `sync_ts`, which advances on every observation and
    /// must not make an otherwise unchanged node look changed.
    pub fn eq_ignoring_sync_ts(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::File(a), Node::File(b)) => {
                let mut b = b.clone();
                b.sync_ts = a.sync_ts;
                *a == b
            }
            (Node::Dir(a), Node::Dir(b)) => {
                let mut b = b.clone();
                b.sync_ts = a.sync_ts;
                *a == b
            }
            _ => false,
        }
    }

    /// Rebase every path in the node onto a new root prefix.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = identifier::normalize_path(&path.into());
        self.identifier_mut().path_list = vec![path];
        self
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_dir() { "dir" } else { "file" };
        write!(f, "{kind} {}", self.identifier())
    }
}

/// Current time in epoch milliseconds, the unit used for every node timestamp.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceUid;

    fn file(uid: i64, path: &str, md5: Option<&str>, size: u64) -> FileNode {
        FileNode {
            identifier: NodeIdentifier::new(DeviceUid(1), Uid(uid), path),
            parent_uids: vec![Uid(1)],
            size_bytes: size,
            md5: md5.map(str::to_string),
            sha256: None,
            sync_ts: 0,
            modify_ts: 0,
            change_ts: 0,
            trashed: TrashStatus::NotTrashed,
            live: true,
            external_id: None,
            version: None,
        }
    }

    #[test]
    fn content_equality_requires_hash_and_size() {
        let a = file(2, "/a/x", Some("aa"), 10);
        let b = file(3, "/b/x", Some("aa"), 10);
        let c = file(4, "/b/y", Some("aa"), 11);
        let d = file(5, "/b/z", None, 10);
        assert!(a.is_content_equal(&b));
        assert!(!a.is_content_equal(&c));
        assert!(!a.is_content_equal(&d));
    }

}
