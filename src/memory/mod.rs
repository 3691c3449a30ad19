//! In-memory tree index
//!
//! One `MemoryIndex` per active tree mirrors the persistent index: a uid→node
//! map, a parent→children map (list-valued on both trees: local dirs have
//! many children, cloud nodes may have many parents), content-hash secondary
//! indices, and a path index. All structural mutations happen under the
//! per-tree lock; merge rules protect the cache from stale or demoting
//! updates.

use crate::device::{DeviceUid, TreeType, Uid};
use crate::error::{EngineError, EngineResult};
use crate::node::{FileNode, Node};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Outcome of an upsert. `structural_change` means the persistent index and
/// any hash/path indices need updating; `presentation_change` alone means
/// only derived display state moved.
#[derive(Debug, Clone)]
pub struct UpdateResult {
    pub node: Node,
    pub structural_change: bool,
    pub presentation_change: bool,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<Uid, Node>,
    /// parent uid → child uids
    children: HashMap<Uid, Vec<Uid>>,
    md5_index: HashMap<String, BTreeSet<Uid>>,
    sha256_index: HashMap<String, BTreeSet<Uid>>,
    /// absolute path → uids. Singleton sets on local trees; cloud nodes can
    /// share a path only transiently (duplicate names under one parent).
    path_index: HashMap<String, BTreeSet<Uid>>,
}

impl Inner {
    fn index_node(&mut self, node: &Node, use_md5: bool, use_sha256: bool) {
        let uid = node.uid();
        if use_md5 {
            if let Some(md5) = node.md5() {
                self.md5_index.entry(md5.to_string()).or_default().insert(uid);
            }
        }
        if use_sha256 {
            if let Some(sha256) = node.sha256() {
                self.sha256_index
                    .entry(sha256.to_string())
                    .or_default()
                    .insert(uid);
            }
        }
        for path in node.path_list() {
            self.path_index.entry(path.clone()).or_default().insert(uid);
        }
        for parent in node.parent_uids() {
            let children = self.children.entry(*parent).or_default();
            if !children.contains(&uid) {
                children.push(uid);
            }
        }
    }

    fn unindex_node(&mut self, node: &Node) {
        let uid = node.uid();
        if let Some(md5) = node.md5() {
            if let Some(set) = self.md5_index.get_mut(md5) {
                set.remove(&uid);
                if set.is_empty() {
                    self.md5_index.remove(md5);
                }
            }
        }
        if let Some(sha256) = node.sha256() {
            if let Some(set) = self.sha256_index.get_mut(sha256) {
                set.remove(&uid);
                if set.is_empty() {
                    self.sha256_index.remove(sha256);
                }
            }
        }
        for path in node.path_list() {
            if let Some(set) = self.path_index.get_mut(path) {
                set.remove(&uid);
                if set.is_empty() {
                    self.path_index.remove(path);
                }
            }
        }
        for parent in node.parent_uids() {
            if let Some(children) = self.children.get_mut(parent) {
                children.retain(|c| *c != uid);
                if children.is_empty() {
                    self.children.remove(parent);
                }
            }
        }
    }
}

pub struct MemoryIndex {
    device_uid: DeviceUid,
    tree_type: TreeType,
    use_md5: bool,
    use_sha256: bool,
    inner: RwLock<Inner>,
}

impl MemoryIndex {
    pub fn new(device_uid: DeviceUid, tree_type: TreeType, use_md5: bool, use_sha256: bool) -> Self {
        Self {
            device_uid,
            tree_type,
            use_md5,
            use_sha256,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn device_uid(&self) -> DeviceUid {
        self.device_uid
    }

    pub fn tree_type(&self) -> TreeType {
        self.tree_type
    }

    /// Insert or merge a node. See the merge rules in the module docs.
    pub fn upsert_node(&self, mut node: Node, update_only: bool) -> EngineResult<UpdateResult> {
        if node.uid().is_null() {
            return Err(EngineError::invariant(format!(
                "Cannot upsert node without a uid: {node}"
            )));
        }
        if node.device_uid() != self.device_uid {
            return Err(EngineError::invariant(format!(
                "Node belongs to device {} but index is for {}",
                node.device_uid(),
                self.device_uid
            )));
        }
        for path in node.path_list() {
            if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) {
                return Err(EngineError::invariant(format!(
                    "Path not normalized: '{path}'"
                )));
            }
        }

        let mut inner = self.inner.write().unwrap();

        let existing = inner.nodes.get(&node.uid()).cloned();
        let merged = match existing {
            Some(cached) => {
                if cached.is_live() && !node.is_live() {
                    // A live cached node is never replaced by a non-live
                    // update; only derived presentation state may change.
                    debug!(
                        "Refusing to replace live node with non-live update: {}",
                        node.identifier()
                    );
                    return Ok(UpdateResult {
                        node: cached,
                        structural_change: false,
                        presentation_change: true,
                    });
                }

                if cached.is_dir() && !node.is_dir() {
                    return Err(EngineError::invariant(format!(
                        "Cannot replace a directory with a file: {}",
                        node.identifier()
                    )));
                }

                if let (Node::File(cached_file), Node::File(fresh)) = (&cached, &mut node) {
                    merge_signature_if_appropriate(cached_file, fresh);
                    check_update_sanity(cached_file, fresh);
                }

                if let (Node::Dir(cached_dir), Node::Dir(fresh)) = (&cached, &mut node) {
                    // all_children_fetched is sticky upward
                    if cached_dir.all_children_fetched {
                        fresh.all_children_fetched = true;
                    }
                }

                if cached.eq_ignoring_sync_ts(&node) {
                    return Ok(UpdateResult {
                        node: cached,
                        structural_change: false,
                        presentation_change: false,
                    });
                }

                inner.unindex_node(&cached);
                node
            }
            None if update_only => {
                debug!("Skipping update of node {}: not in cache", node.uid());
                return Ok(UpdateResult {
                    node,
                    structural_change: false,
                    presentation_change: false,
                });
            }
            None => node,
        };

        inner.index_node(&merged, self.use_md5, self.use_sha256);
        inner.nodes.insert(merged.uid(), merged.clone());

        Ok(UpdateResult {
            node: merged,
            structural_change: true,
            presentation_change: true,
        })
    }

    /// Remove a node. Refuses to remove a directory that still has children.
    pub fn remove_node(&self, uid: Uid) -> EngineResult<Option<Node>> {
        let mut inner = self.inner.write().unwrap();

        let Some(node) = inner.nodes.get(&uid).cloned() else {
            warn!("Cannot remove node {uid}: already absent from cache");
            return Ok(None);
        };

        if node.is_dir() {
            if let Some(children) = inner.children.get(&uid) {
                if !children.is_empty() {
                    return Err(EngineError::invariant(format!(
                        "Cannot remove dir from cache: it still has {} children: {}",
                        children.len(),
                        node.identifier()
                    )));
                }
            }
        }

        inner.unindex_node(&node);
        inner.nodes.remove(&uid);
        inner.children.remove(&uid);
        Ok(Some(node))
    }

    /// Detach a node during an in-index move, bypassing the non-empty-dir
    /// guard. The caller reinserts the node at its new path immediately; the
    /// children mapping for the node's own uid is preserved so descendants
    /// stay linked while they are rebased one by one.
    pub fn remove_node_for_move(&self, uid: Uid) -> Option<Node> {
        let mut inner = self.inner.write().unwrap();
        let node = inner.nodes.get(&uid).cloned()?;
        inner.unindex_node(&node);
        inner.nodes.remove(&uid);
        Some(node)
    }

    pub fn get_node(&self, uid: Uid) -> Option<Node> {
        self.inner.read().unwrap().nodes.get(&uid).cloned()
    }

    /// First node at the given path (local trees have at most one).
    pub fn node_for_path(&self, path: &str) -> Option<Node> {
        let inner = self.inner.read().unwrap();
        let set = inner.path_index.get(path)?;
        set.iter().next().and_then(|uid| inner.nodes.get(uid)).cloned()
    }

    pub fn nodes_for_path(&self, path: &str) -> Vec<Node> {
        let inner = self.inner.read().unwrap();
        inner
            .path_index
            .get(path)
            .map(|set| {
                set.iter()
                    .filter_map(|uid| inner.nodes.get(uid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn children_of(&self, uid: Uid) -> Vec<Node> {
        let inner = self.inner.read().unwrap();
        inner
            .children
            .get(&uid)
            .map(|uids| {
                uids.iter()
                    .filter_map(|c| inner.nodes.get(c))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn child_count(&self, uid: Uid) -> usize {
        self.inner
            .read()
            .unwrap()
            .children
            .get(&uid)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn nodes_with_md5(&self, md5: &str) -> Vec<Node> {
        let inner = self.inner.read().unwrap();
        inner
            .md5_index
            .get(md5)
            .map(|set| {
                set.iter()
                    .filter_map(|uid| inner.nodes.get(uid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all_md5s(&self) -> BTreeSet<String> {
        self.inner.read().unwrap().md5_index.keys().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().unwrap().nodes.len()
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.inner.read().unwrap().nodes.values().cloned().collect()
    }

    /// Live, untrashed file nodes whose path falls under the given subtree
    /// root. Used to build diff snapshots.
    pub fn files_under(&self, root_path: &str, include_trashed: bool) -> Vec<FileNode> {
        let prefix = if root_path == "/" {
            "/".to_string()
        } else {
            format!("{root_path}/")
        };
        let inner = self.inner.read().unwrap();
        let mut out = Vec::new();
        for node in inner.nodes.values() {
            let Node::File(file) = node else { continue };
            if !file.live {
                continue;
            }
            if !include_trashed && file.trashed.is_trashed() {
                continue;
            }
            if file
                .identifier
                .path_list
                .iter()
                .any(|p| p == root_path || p.starts_with(&prefix))
            {
                out.push(file.clone());
            }
        }
        out
    }

    /// All uids with a path under the given subtree root, deepest paths
    /// first (so children sort before their parents).
    pub fn uids_under(&self, root_path: &str) -> Vec<Uid> {
        let prefix = if root_path == "/" {
            "/".to_string()
        } else {
            format!("{root_path}/")
        };
        let inner = self.inner.read().unwrap();
        let mut with_depth: Vec<(usize, Uid)> = inner
            .nodes
            .values()
            .filter(|n| {
                n.path_list()
                    .iter()
                    .any(|p| p == root_path || p.starts_with(&prefix))
            })
            .map(|n| (n.single_path().matches('/').count(), n.uid()))
            .collect();
        with_depth.sort_by(|a, b| b.0.cmp(&a.0));
        with_depth.into_iter().map(|(_, uid)| uid).collect()
    }
}

/// If metadata matches, a missing hash on either side is filled from the
/// other, avoiding a re-hash of unchanged content.
fn merge_signature_if_appropriate(cached: &FileNode, fresh: &mut FileNode) {
    if !cached.meta_matches(fresh) {
        return;
    }
    match (&fresh.md5, &cached.md5) {
        (Some(f), Some(c)) if f != c => {
            warn!(
                "Fresh node has unexpected MD5 (expected {c}, got {f}): {}",
                fresh.identifier
            );
        }
        (None, Some(c)) => fresh.md5 = Some(c.clone()),
        _ => {}
    }
    match (&fresh.sha256, &cached.sha256) {
        (Some(f), Some(c)) if f != c => {
            warn!(
                "Fresh node has unexpected SHA-256 (expected {c}, got {f}): {}",
                fresh.identifier
            );
        }
        (None, Some(c)) => fresh.sha256 = Some(c.clone()),
        _ => {}
    }
}

/// Updates that go backwards in time are legal (clock skew, restored
/// backups) but worth a log line.
fn check_update_sanity(cached: &FileNode, fresh: &FileNode) {
    if cached.modify_ts != 0 && fresh.modify_ts != 0 && fresh.modify_ts < cached.modify_ts {
        warn!(
            "File {}: update has older modify_ts ({}) than cached ({})",
            fresh.identifier, fresh.modify_ts, cached.modify_ts
        );
    }
    if fresh.size_bytes != cached.size_bytes
        && cached.md5.is_some()
        && fresh.md5 == cached.md5
    {
        warn!(
            "File {}: same MD5 but different size (old={}, new={})",
            fresh.identifier, cached.size_bytes, fresh.size_bytes
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{DirNode, NodeIdentifier, TrashStatus};

    fn index() -> MemoryIndex {
        MemoryIndex::new(DeviceUid(1), TreeType::LocalDisk, true, false)
    }

    fn dir(uid: i64, path: &str, parent: i64) -> Node {
        Node::Dir(DirNode {
            identifier: NodeIdentifier::new(DeviceUid(1), Uid(uid), path),
            parent_uids: vec![Uid(parent)],
            trashed: TrashStatus::NotTrashed,
            live: true,
            all_children_fetched: false,
            sync_ts: 0,
            external_id: None,
        })
    }

    fn file(uid: i64, path: &str, parent: i64, md5: Option<&str>) -> Node {
        Node::File(FileNode {
            identifier: NodeIdentifier::new(DeviceUid(1), Uid(uid), path),
            parent_uids: vec![Uid(parent)],
            size_bytes: 3,
            md5: md5.map(str::to_string),
            sha256: None,
            sync_ts: 1,
            modify_ts: 10,
            change_ts: 10,
            trashed: TrashStatus::NotTrashed,
            live: true,
            external_id: None,
            version: None,
        })
    }

    #[test]
    fn upsert_is_idempotent() {
        let idx = index();
        let first = idx.upsert_node(file(2, "/a/x", 1, Some("h1")), false).unwrap();
        assert!(first.structural_change);
        let second = idx.upsert_node(file(2, "/a/x", 1, Some("h1")), false).unwrap();
        assert!(!second.structural_change);
    }

    #[test]
    fn update_only_skips_unknown_nodes() {
        let idx = index();
        let result = idx.upsert_node(file(2, "/a/x", 1, None), true).unwrap();
        assert!(!result.structural_change);
        assert!(idx.get_node(Uid(2)).is_none());
    }

    #[test]
    fn live_node_not_replaced_by_non_live() {
        let idx = index();
        idx.upsert_node(file(2, "/a/x", 1, Some("h1")), false).unwrap();
        let mut dead = file(2, "/a/x", 1, Some("h1"));
        dead.set_live(false);
        let result = idx.upsert_node(dead, false).unwrap();
        assert!(!result.structural_change);
        assert!(idx.get_node(Uid(2)).unwrap().is_live());
    }

    #[test]
    fn dir_cannot_be_demoted_to_file() {
        let idx = index();
        idx.upsert_node(dir(2, "/a/sub", 1), false).unwrap();
        let err = idx.upsert_node(file(2, "/a/sub", 1, None), false).unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[test]
    fn all_children_fetched_is_sticky() {
        let idx = index();
        let mut fetched = dir(2, "/a/sub", 1);
        if let Node::Dir(d) = &mut fetched {
            d.all_children_fetched = true;
        }
        idx.upsert_node(fetched, false).unwrap();
        let result = idx.upsert_node(dir(2, "/a/sub", 1), false).unwrap();
        match result.node {
            Node::Dir(d) => assert!(d.all_children_fetched),
            _ => panic!("expected dir"),
        }
    }

    #[test]
    fn cached_hash_copied_when_meta_matches() {
        let idx = index();
        idx.upsert_node(file(2, "/a/x", 1, Some("h1")), false).unwrap();
        let result = idx.upsert_node(file(2, "/a/x", 1, None), false).unwrap();
        assert_eq!(result.node.md5(), Some("h1"));
        // And the hash index still finds it:
        assert_eq!(idx.nodes_with_md5("h1").len(), 1);
    }

    #[test]
    fn remove_rejects_non_empty_dir() {
        let idx = index();
        idx.upsert_node(dir(2, "/a/sub", 1), false).unwrap();
        idx.upsert_node(file(3, "/a/sub/x", 2, None), false).unwrap();
        assert!(idx.remove_node(Uid(2)).is_err());
        idx.remove_node(Uid(3)).unwrap();
        assert!(idx.remove_node(Uid(2)).unwrap().is_some());
    }

    #[test]
    fn secondary_indices_follow_hash_change() {
        let idx = index();
        idx.upsert_node(file(2, "/a/x", 1, Some("old")), false).unwrap();
        let mut changed = file(2, "/a/x", 1, Some("new"));
        if let Node::File(f) = &mut changed {
            f.modify_ts = 20;
            f.change_ts = 20;
        }
        idx.upsert_node(changed, false).unwrap();
        assert!(idx.nodes_with_md5("old").is_empty());
        assert_eq!(idx.nodes_with_md5("new").len(), 1);
    }

    #[test]
    fn files_under_respects_subtree_and_trash() {
        let idx = index();
        idx.upsert_node(file(2, "/a/x", 1, Some("h1")), false).unwrap();
        idx.upsert_node(file(3, "/b/y", 1, Some("h2")), false).unwrap();
        let mut trashed = file(4, "/a/z", 1, Some("h3"));
        trashed.set_trashed(TrashStatus::ExplicitlyTrashed);
        idx.upsert_node(trashed, false).unwrap();

        let under_a = idx.files_under("/a", false);
        assert_eq!(under_a.len(), 1);
        assert_eq!(under_a[0].identifier.single_path(), "/a/x");
        assert_eq!(idx.files_under("/a", true).len(), 2);
    }
}
