//! Local tree store
//!
//! Owns one local device's memory index, cache database, and uid registry.

use crate::db::local_store::LocalDiskStore;
use crate::device::{Device, Uid};
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventBus};
use crate::memory::{MemoryIndex, UpdateResult};
use crate::node::identifier::{path_parent, normalize_path};
use crate::node::{DirNode, FileNode, Node, NodeIdentifier, TrashStatus};
use crate::registry::UidRegistry;
use crate::scan::hasher::ContentHasher;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub struct LocalTreeStore {
    pub device: Device,
    pub registry: Arc<UidRegistry>,
    pub memory: Arc<MemoryIndex>,
    pub disk: Arc<LocalDiskStore>,
    events: Arc<EventBus>,
}

impl LocalTreeStore {
    pub fn new(
        device: Device,
        registry: Arc<UidRegistry>,
        memory: Arc<MemoryIndex>,
        disk: Arc<LocalDiskStore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            device,
            registry,
            memory,
            disk,
            events,
        }
    }

    /// Populate the memory index from the cache database. Returns the node
    /// count loaded.
    pub async fn load_from_cache(&self) -> EngineResult<usize> {
        let nodes = self.disk.load_all(&self.registry).await?;
        let count = nodes.len();
        for node in nodes {
            self.memory.upsert_node(node, false)?;
        }
        info!(
            "Loaded {count} cached nodes for local device {}",
            self.device.uid
        );
        self.events.emit(Event::TreeLoaded {
            device_uid: self.device.uid,
            node_count: count,
        });
        Ok(count)
    }

    /// Upsert one node write-through.
    pub async fn upsert_node(&self, node: Node) -> EngineResult<UpdateResult> {
        let result = self.memory.upsert_node(node, false)?;
        if result.structural_change {
            self.disk.upsert_node(&result.node).await?;
            self.events.emit(Event::NodeUpserted {
                node: result.node.clone(),
            });
        }
        Ok(result)
    }

    /// Upsert a batch; persistent writeback happens once for the whole batch.
    pub async fn upsert_node_list(&self, nodes: Vec<Node>) -> EngineResult<usize> {
        let mut changed = Vec::new();
        for node in nodes {
            let result = self.memory.upsert_node(node, false)?;
            if result.structural_change {
                changed.push(result.node);
            }
        }
        if !changed.is_empty() {
            self.disk.upsert_node_list(&changed).await?;
            for node in &changed {
                self.events.emit(Event::NodeUpserted { node: node.clone() });
            }
        }
        Ok(changed.len())
    }

    pub async fn remove_node(&self, uid: Uid) -> EngineResult<Option<Node>> {
        let removed = self.memory.remove_node(uid)?;
        if removed.is_some() {
            self.disk.delete_for_uid_list(&[uid]).await?;
            self.events.emit(Event::NodeRemoved {
                device_uid: self.device.uid,
                uid,
            });
        }
        Ok(removed)
    }

    /// Remove a whole subtree, children before parents.
    pub async fn remove_subtree(&self, root_path: &str) -> EngineResult<usize> {
        let uids = self.memory.uids_under(root_path);
        let mut removed = 0;
        for uid in &uids {
            if self.memory.remove_node(*uid)?.is_some() {
                removed += 1;
                self.events.emit(Event::NodeRemoved {
                    device_uid: self.device.uid,
                    uid: *uid,
                });
            }
        }
        self.disk.delete_for_uid_list(&uids).await?;
        debug!("Removed subtree '{root_path}' ({removed} nodes)");
        Ok(removed)
    }

    pub fn node_for_path(&self, path: &str) -> Option<Node> {
        self.memory.node_for_path(&normalize_path(path))
    }

    /// Build a file node by statting the live filesystem, reusing the cached
    /// hash when metadata is unchanged (the memory merge handles that).
    pub async fn build_file_node(
        &self,
        full_path: &str,
        hasher: Option<&ContentHasher>,
    ) -> EngineResult<Node> {
        let meta = tokio::fs::symlink_metadata(Path::new(full_path)).await?;
        let uid = self.registry.uid_for_path(full_path, None);
        let parent_uid = match path_parent(full_path) {
            Some(parent) => self.registry.uid_for_path(parent, None),
            None => Uid::NULL,
        };

        let signatures = match hasher {
            Some(hasher) => hasher.calculate_signatures(Path::new(full_path)).await?,
            None => Default::default(),
        };

        Ok(Node::File(FileNode {
            identifier: NodeIdentifier::new(self.device.uid, uid, full_path),
            parent_uids: vec![parent_uid],
            size_bytes: meta.len(),
            md5: signatures.md5,
            sha256: signatures.sha256,
            sync_ts: crate::node::now_ts(),
            modify_ts: ts_millis(meta.modified()),
            change_ts: ts_millis(meta.created().or_else(|_| meta.modified())),
            trashed: TrashStatus::NotTrashed,
            live: true,
            external_id: None,
            version: None,
        }))
    }

    pub fn build_dir_node(&self, full_path: &str, all_children_fetched: bool) -> Node {
        let uid = self.registry.uid_for_path(full_path, None);
        let parent_uid = match path_parent(full_path) {
            Some(parent) => self.registry.uid_for_path(parent, None),
            None => Uid::NULL,
        };
        Node::Dir(DirNode {
            identifier: NodeIdentifier::new(self.device.uid, uid, full_path),
            parent_uids: vec![parent_uid],
            trashed: TrashStatus::NotTrashed,
            live: true,
            all_children_fetched,
            sync_ts: crate::node::now_ts(),
            external_id: None,
        })
    }

    /// Apply a rename observed or performed on disk: rebind the registry
    /// mapping and rewrite the node (and its descendants for a dir).
    pub async fn move_subtree(&self, src_path: &str, dst_path: &str) -> EngineResult<Vec<(Node, Node)>> {
        let src_path = normalize_path(src_path);
        let dst_path = normalize_path(dst_path);
        let mut moved = Vec::new();

        let uids = {
            let mut uids = self.memory.uids_under(&src_path);
            uids.reverse(); // parents before children so paths rebase cleanly
            uids
        };
        if uids.is_empty() {
            return Err(EngineError::node_not_found(format!(
                "No cached nodes under '{src_path}'"
            )));
        }

        for uid in uids {
            let Some(old) = self.memory.get_node(uid) else { continue };
            let old_path = old.single_path().to_string();
            let suffix = old_path.strip_prefix(&src_path).unwrap_or("");
            let new_path = format!("{dst_path}{suffix}");

            self.registry.update_path_for_uid(uid, &new_path);
            let new_parent = match path_parent(&new_path) {
                Some(parent) => self.registry.uid_for_path(parent, None),
                None => Uid::NULL,
            };

            let mut updated = old.clone().with_path(&new_path);
            updated.set_parent_uids(vec![new_parent]);

            // Remove + reinsert so the path index follows the node.
            self.memory.remove_node_for_move(uid);
            let result = self.memory.upsert_node(updated, false)?;
            self.disk.upsert_node(&result.node).await?;
            self.events.emit(Event::NodeUpserted {
                node: result.node.clone(),
            });
            moved.push((old, result.node));
        }

        Ok(moved)
    }
}

fn ts_millis(time: std::io::Result<std::time::SystemTime>) -> i64 {
    time.ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
