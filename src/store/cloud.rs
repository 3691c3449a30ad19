//! Cloud tree store
//!
//! Owns one cloud account's memory index, cache database, and uid registry.
//! The cloud tree is a multi-parent DAG: parent links live in a mapping
//! table, and full path lists are compiled by BFS from the root nodes.

use crate::db::cloud_store::{CloudDiskStore, ParentMapping};
use crate::device::{Device, Uid};
use crate::error::EngineResult;
use crate::events::{Event, EventBus};
use crate::memory::{MemoryIndex, UpdateResult};
use crate::node::identifier::path_join;
use crate::node::Node;
use crate::registry::UidRegistry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct CloudTreeStore {
    pub device: Device,
    pub registry: Arc<UidRegistry>,
    pub memory: Arc<MemoryIndex>,
    pub disk: Arc<CloudDiskStore>,
    events: Arc<EventBus>,
}

impl CloudTreeStore {
    pub fn new(
        device: Device,
        registry: Arc<UidRegistry>,
        memory: Arc<MemoryIndex>,
        disk: Arc<CloudDiskStore>,
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

    /// Populate the memory index from the cache database: load nodes and
    /// parent mappings, link parents, compile path lists, then upsert.
    pub async fn load_from_cache(&self) -> EngineResult<usize> {
        let mut nodes = self.disk.load_all(&self.registry).await?;
        let mappings = self.disk.get_id_parent_mappings().await?;
        link_parents(&mut nodes, &mappings);
        let path_count = compile_full_paths(&mut nodes);
        debug!(
            "Compiled {path_count} full paths for {} cloud nodes",
            nodes.len()
        );

        let count = nodes.len();
        for node in nodes {
            self.memory.upsert_node(node, false)?;
        }
        info!(
            "Loaded {count} cached nodes for cloud device {}",
            self.device.uid
        );
        self.events.emit(Event::TreeLoaded {
            device_uid: self.device.uid,
            node_count: count,
        });
        Ok(count)
    }

    /// Upsert one node write-through, refreshing its parent mappings.
    pub async fn upsert_node(&self, node: Node) -> EngineResult<UpdateResult> {
        let result = self.memory.upsert_node(node, false)?;
        if result.structural_change {
            self.disk.upsert_node(&result.node).await?;
            let mappings = self.mappings_for(&result.node);
            self.disk
                .upsert_mappings_for_child(result.node.uid(), &mappings)
                .await?;
            self.events.emit(Event::NodeUpserted {
                node: result.node.clone(),
            });
        }
        Ok(result)
    }

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
                let mappings = self.mappings_for(node);
                self.disk
                    .upsert_mappings_for_child(node.uid(), &mappings)
                    .await?;
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

    pub fn node_for_external_id(&self, external_id: &str) -> Option<Node> {
        let uid = self.registry.uid_for_external_id(external_id, None);
        self.memory.get_node(uid)
    }

    fn mappings_for(&self, node: &Node) -> Vec<ParentMapping> {
        node.parent_uids()
            .iter()
            .filter_map(|parent_uid| {
                match self.registry.external_id_for_uid(*parent_uid) {
                    Some(external_parent_id) => Some(ParentMapping {
                        child_uid: node.uid(),
                        parent_uid: Some(*parent_uid),
                        external_parent_id,
                        sync_ts: node.sync_ts(),
                    }),
                    None => {
                        warn!(
                            "No external id known for parent {parent_uid} of {}",
                            node.identifier()
                        );
                        None
                    }
                }
            })
            .collect()
    }
}

/// Fill in `parent_uids` on each node from the mapping table rows.
pub fn link_parents(nodes: &mut [Node], mappings: &[ParentMapping]) {
    let mut parents_by_child: HashMap<Uid, Vec<Uid>> = HashMap::new();
    for mapping in mappings {
        if let Some(parent_uid) = mapping.parent_uid {
            parents_by_child
                .entry(mapping.child_uid)
                .or_default()
                .push(parent_uid);
        }
    }
    for node in nodes.iter_mut() {
        if let Some(parents) = parents_by_child.remove(&node.uid()) {
            node.set_parent_uids(parents);
        }
    }
}

/// Compute the full path list of every node by BFS from the roots (nodes
/// with no parents). A node reachable through several parent chains gets one
/// path per chain. Returns the number of paths produced.
pub fn compile_full_paths(nodes: &mut [Node]) -> usize {
    let mut by_uid: HashMap<Uid, usize> = HashMap::new();
    let mut children_of: HashMap<Uid, Vec<Uid>> = HashMap::new();
    for (idx, node) in nodes.iter().enumerate() {
        by_uid.insert(node.uid(), idx);
        for parent in node.parent_uids() {
            children_of.entry(*parent).or_default().push(node.uid());
        }
    }

    let mut path_count = 0usize;
    let mut queue: VecDeque<Uid> = VecDeque::new();

    for node in nodes.iter_mut() {
        if node.parent_uids().is_empty() {
            let name = node.name().to_string();
            node.identifier_mut().path_list = vec![format!("/{name}")];
            queue.push_back(node.uid());
            path_count += 1;
        }
    }

    while let Some(uid) = queue.pop_front() {
        let Some(&parent_idx) = by_uid.get(&uid) else { continue };
        let parent_paths = nodes[parent_idx].path_list().to_vec();
        let is_dir = nodes[parent_idx].is_dir();
        if !is_dir {
            continue;
        }
        let Some(children) = children_of.get(&uid) else { continue };
        for child_uid in children.clone() {
            let Some(&child_idx) = by_uid.get(&child_uid) else { continue };
            let name = nodes[child_idx].name().to_string();
            let mut child_paths = Vec::new();
            for parent_path in &parent_paths {
                child_paths.push(path_join(parent_path, &name));
                path_count += 1;
            }
            // A multi-parent child is visited once per parent; accumulate.
            let existing = &mut nodes[child_idx].identifier_mut().path_list;
            let had_placeholder =
                existing.len() == 1 && *existing == vec![format!("/{name}")];
            if had_placeholder {
                *existing = child_paths;
            } else {
                for p in child_paths {
                    if !existing.contains(&p) {
                        existing.push(p);
                    }
                }
            }
            if nodes[child_idx].is_dir() {
                queue.push_back(child_uid);
            }
        }
    }

    path_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceUid;
    use crate::node::{DirNode, FileNode, NodeIdentifier, TrashStatus};

    fn cloud_dir(uid: i64, name: &str, parents: Vec<i64>) -> Node {
        Node::Dir(DirNode {
            identifier: NodeIdentifier::new(DeviceUid(2), Uid(uid), format!("/{name}")),
            parent_uids: parents.into_iter().map(Uid).collect(),
            trashed: TrashStatus::NotTrashed,
            live: true,
            all_children_fetched: false,
            sync_ts: 0,
            external_id: Some(format!("x{uid}")),
        })
    }

    fn cloud_file(uid: i64, name: &str, parents: Vec<i64>) -> Node {
        Node::File(FileNode {
            identifier: NodeIdentifier::new(DeviceUid(2), Uid(uid), format!("/{name}")),
            parent_uids: parents.into_iter().map(Uid).collect(),
            size_bytes: 1,
            md5: None,
            sha256: None,
            sync_ts: 0,
            modify_ts: 0,
            change_ts: 0,
            trashed: TrashStatus::NotTrashed,
            live: true,
            external_id: Some(format!("x{uid}")),
            version: None,
        })
    }

    #[test]
    fn compiles_single_chain_paths() {
        let mut nodes = vec![
            cloud_dir(1, "My Drive", vec![]),
            cloud_dir(2, "docs", vec![1]),
            cloud_file(3, "a.txt", vec![2]),
        ];
        compile_full_paths(&mut nodes);
        assert_eq!(nodes[2].path_list(), ["/My Drive/docs/a.txt"]);
    }

    #[test]
    fn multi_parent_node_gets_one_path_per_chain() {
        let mut nodes = vec![
            cloud_dir(1, "root", vec![]),
            cloud_dir(2, "a", vec![1]),
            cloud_dir(3, "b", vec![1]),
            cloud_file(4, "shared.txt", vec![2, 3]),
        ];
        compile_full_paths(&mut nodes);
        let mut paths = nodes[3].path_list().to_vec();
        paths.sort();
        assert_eq!(paths, ["/root/a/shared.txt", "/root/b/shared.txt"]);
    }

    #[test]
    fn link_parents_fills_translated_mappings_only() {
        let mut nodes = vec![cloud_file(4, "f", vec![])];
        let mappings = vec![
            ParentMapping {
                child_uid: Uid(4),
                parent_uid: Some(Uid(2)),
                external_parent_id: "x2".into(),
                sync_ts: 0,
            },
            ParentMapping {
                child_uid: Uid(4),
                parent_uid: None,
                external_parent_id: "x9".into(),
                sync_ts: 0,
            },
        ];
        link_parents(&mut nodes, &mappings);
        assert_eq!(nodes[0].parent_uids(), [Uid(2)]);
    }
}
