//! Op graph
//!
//! Pending work is a DAG of operation nodes. Each staged op contributes one
//! graph node per side it touches (source and destination for copies and
//! moves). Edges express "must wait for": a node is runnable once every
//! parent has completed. RM nodes are wired inverted: a directory's RM has
//! its children's RMs as parents and its own parent directory's RM as its
//! child, so contents always go before their directory.
//!
//! The graph is acyclic by construction (every new edge points from an
//! existing node to a new one); an explicit check guards the invariant and
//! aborts the batch if it ever breaks.

use super::{Op, OpStatus};
use crate::device::{DeviceUid, Uid};
use crate::error::{EngineError, EngineResult};
use crate::node::identifier::path_parent;
use crate::node::Node;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, warn};

const ROOT_GRAPH_UID: Uid = Uid(1);

type TargetKey = (DeviceUid, Uid);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Root,
    Src,
    Dst,
    Rm,
}

struct GraphNode {
    uid: Uid,
    kind: NodeKind,
    op: Option<Arc<Op>>,
    parents: Vec<Uid>,
    children: Vec<Uid>,
    completed: bool,
    failed: bool,
}

impl GraphNode {
    /// Re-entrant nodes tolerate concurrent pending ops on their target.
    /// Only copy sources are re-entrant: many readers of one source are
    /// fine, while creators, movers and removers are mutually exclusive.
    fn is_reentrant(&self) -> bool {
        match self.kind {
            NodeKind::Root => true,
            NodeKind::Src => self
                .op
                .as_ref()
                .map(|op| {
                    matches!(
                        op.op_type,
                        super::OpType::Cp | super::OpType::CpOnto | super::OpType::StartDirCp
                    )
                })
                .unwrap_or(false),
            NodeKind::Dst | NodeKind::Rm => false,
        }
    }

    fn target(&self) -> Option<&Node> {
        let op = self.op.as_ref()?;
        match self.kind {
            NodeKind::Root => None,
            NodeKind::Src | NodeKind::Rm => Some(&op.src_node),
            NodeKind::Dst => op.dst_node.as_ref(),
        }
    }

    fn target_key(&self) -> Option<TargetKey> {
        self.target().map(|t| (t.device_uid(), t.uid()))
    }
}

#[derive(Default)]
struct ExecEntry {
    readers: usize,
    writer: bool,
}

struct GraphInner {
    nodes: HashMap<Uid, GraphNode>,
    /// Runnable-order view of staged ops
    ops: BTreeMap<Uid, Vec<Uid>>,
    op_status: HashMap<Uid, OpStatus>,
    op_by_uid: HashMap<Uid, Arc<Op>>,
    /// Pending (not completed) graph nodes per target node
    by_target: HashMap<TargetKey, Vec<Uid>>,
    /// Targets currently being executed against
    executing: HashMap<TargetKey, ExecEntry>,
}

impl GraphInner {
    fn node(&self, uid: Uid) -> &GraphNode {
        &self.nodes[&uid]
    }

    fn last_pending_on_target(&self, key: TargetKey, exclude_op: Uid) -> Option<Uid> {
        self.by_target.get(&key).and_then(|uids| {
            uids.iter()
                .rev()
                .find(|uid| {
                    let node = &self.nodes[uid];
                    !node.completed
                        && node
                            .op
                            .as_ref()
                            .map(|op| op.op_uid != exclude_op)
                            .unwrap_or(true)
                })
                .copied()
        })
    }

    fn link(&mut self, parent: Uid, child: Uid) {
        if parent == child {
            return;
        }
        {
            let p = self.nodes.get_mut(&parent).expect("parent node exists");
            if !p.children.contains(&child) {
                p.children.push(child);
            }
        }
        let c = self.nodes.get_mut(&child).expect("child node exists");
        if !c.parents.contains(&parent) {
            c.parents.push(parent);
        }
    }

    /// True when a cycle is reachable from `start` by following children.
    fn has_cycle_from(&self, start: Uid) -> bool {
        let mut stack = vec![(start, false)];
        let mut visiting: HashSet<Uid> = HashSet::new();
        let mut visited: HashSet<Uid> = HashSet::new();

        while let Some((uid, processed)) = stack.pop() {
            if processed {
                visiting.remove(&uid);
                visited.insert(uid);
                continue;
            }
            if visited.contains(&uid) {
                continue;
            }
            if !visiting.insert(uid) {
                return true;
            }
            stack.push((uid, true));
            for child in &self.nodes[&uid].children {
                if visiting.contains(child) {
                    return true;
                }
                if !visited.contains(child) {
                    stack.push((*child, false));
                }
            }
        }
        false
    }

    /// Longest dependency chain above the node, root exclusive.
    fn level_of(&self, uid: Uid) -> usize {
        let node = &self.nodes[&uid];
        node.parents
            .iter()
            .filter(|p| **p != ROOT_GRAPH_UID)
            .map(|p| self.level_of(*p))
            .max()
            .map(|depth| depth + 1)
            .unwrap_or(1)
    }

    fn find_ready(&mut self) -> Option<Arc<Op>> {
        let candidate = self.ops.iter().find_map(|(op_uid, node_uids)| {
            if self.op_status.get(op_uid) != Some(&OpStatus::NotStarted) {
                return None;
            }
            let all_ready = node_uids.iter().all(|uid| {
                let node = &self.nodes[uid];
                if node.failed {
                    return false;
                }
                let parents_done = node
                    .parents
                    .iter()
                    .all(|p| *p == ROOT_GRAPH_UID || self.nodes[p].completed);
                if !parents_done {
                    return false;
                }
                match node.target_key() {
                    Some(key) => match self.executing.get(&key) {
                        None => true,
                        Some(entry) => {
                            // Readers may share a target; writers may not.
                            node.is_reentrant() && !entry.writer
                        }
                    },
                    None => true,
                }
            });
            all_ready.then(|| (*op_uid, node_uids.clone()))
        });

        let (op_uid, node_uids) = candidate?;
        for uid in &node_uids {
            let reentrant = self.nodes[uid].is_reentrant();
            if let Some(key) = self.nodes[uid].target_key() {
                let entry = self.executing.entry(key).or_default();
                if reentrant {
                    entry.readers += 1;
                } else {
                    entry.writer = true;
                }
            }
        }
        self.op_status.insert(op_uid, OpStatus::Executing);
        self.op_by_uid.get(&op_uid).cloned()
    }

    fn release_targets(&mut self, node_uids: &[Uid]) {
        for uid in node_uids {
            let reentrant = self.nodes[uid].is_reentrant();
            if let Some(key) = self.nodes[uid].target_key() {
                if let Some(entry) = self.executing.get_mut(&key) {
                    if reentrant {
                        entry.readers = entry.readers.saturating_sub(1);
                    } else {
                        entry.writer = false;
                    }
                    if entry.readers == 0 && !entry.writer {
                        self.executing.remove(&key);
                    }
                }
            }
        }
    }
}

pub struct OpGraph {
    inner: Mutex<GraphInner>,
    notify: Notify,
    next_graph_uid: AtomicI64,
    was_shutdown: AtomicBool,
}

impl Default for OpGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl OpGraph {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_GRAPH_UID,
            GraphNode {
                uid: ROOT_GRAPH_UID,
                kind: NodeKind::Root,
                op: None,
                parents: Vec::new(),
                children: Vec::new(),
                completed: true,
                failed: false,
            },
        );
        Self {
            inner: Mutex::new(GraphInner {
                nodes,
                ops: BTreeMap::new(),
                op_status: HashMap::new(),
                op_by_uid: HashMap::new(),
                by_target: HashMap::new(),
                executing: HashMap::new(),
            }),
            notify: Notify::new(),
            next_graph_uid: AtomicI64::new(ROOT_GRAPH_UID.0 + 1),
            was_shutdown: AtomicBool::new(false),
        }
    }

    /// Enqueue every op of a batch. Fails atomically from the caller's point
    /// of view: an invariant violation aborts the whole batch.
    pub fn enqueue_batch(&self, batch: &super::Batch) -> EngineResult<()> {
        for op in &batch.ops {
            self.enqueue_op(op.clone())?;
        }
        Ok(())
    }

    pub fn enqueue_op(&self, op: Op) -> EngineResult<()> {
        if op.op_type.has_dst() && op.dst_node.is_none() {
            return Err(EngineError::invariant(format!(
                "{} op requires a destination node: {op}",
                op.op_type
            )));
        }

        let op = Arc::new(op);
        let mut inner = self.inner.lock().unwrap();

        let mut node_uids = Vec::new();
        let src_uid = self.alloc_uid();
        let src_kind = if op.op_type.is_remove() {
            NodeKind::Rm
        } else {
            NodeKind::Src
        };
        inner.nodes.insert(
            src_uid,
            GraphNode {
                uid: src_uid,
                kind: src_kind,
                op: Some(op.clone()),
                parents: Vec::new(),
                children: Vec::new(),
                completed: false,
                failed: false,
            },
        );
        node_uids.push(src_uid);

        if op.has_dst() {
            let dst_uid = self.alloc_uid();
            inner.nodes.insert(
                dst_uid,
                GraphNode {
                    uid: dst_uid,
                    kind: NodeKind::Dst,
                    op: Some(op.clone()),
                    parents: Vec::new(),
                    children: Vec::new(),
                    completed: false,
                    failed: false,
                },
            );
            node_uids.push(dst_uid);
        }

        for uid in node_uids.clone() {
            self.wire_dependencies(&mut inner, uid)?;
        }

        // Register pending nodes per target, then verify acyclicity.
        for uid in &node_uids {
            if let Some(key) = inner.nodes[uid].target_key() {
                inner.by_target.entry(key).or_default().push(*uid);
            }
        }
        for uid in &node_uids {
            if inner.has_cycle_from(*uid) {
                return Err(EngineError::invariant(format!(
                    "Cycle detected while enqueueing {op}"
                )));
            }
        }

        debug!("Enqueued {op} as graph nodes {node_uids:?}");
        inner.ops.insert(op.op_uid, node_uids);
        inner.op_status.insert(op.op_uid, OpStatus::NotStarted);
        inner.op_by_uid.insert(op.op_uid, op);
        drop(inner);

        self.notify.notify_waiters();
        Ok(())
    }

    fn wire_dependencies(&self, inner: &mut GraphInner, uid: Uid) -> EngineResult<()> {
        let (kind, op) = {
            let node = inner.node(uid);
            (node.kind, node.op.clone().expect("op node has op"))
        };
        let target = {
            let node = inner.node(uid);
            node.target().cloned()
        };
        let Some(target) = target else { return Ok(()) };
        let target_key = (target.device_uid(), target.uid());

        let mut linked_parent = false;

        // Rule 1: a pending op on the same target serializes us behind it,
        // unless both nodes are re-entrant readers, which share the parent.
        if let Some(pending_uid) = inner.last_pending_on_target(target_key, op.op_uid) {
            let pending_reentrant = inner.node(pending_uid).is_reentrant();
            let self_reentrant = inner.node(uid).is_reentrant();
            if pending_reentrant && self_reentrant {
                for parent in inner.node(pending_uid).parents.clone() {
                    inner.link(parent, uid);
                    linked_parent = true;
                }
            } else {
                inner.link(pending_uid, uid);
                linked_parent = true;
            }
        }

        // Rule 2 and 3: creation under a directory that is itself pending
        // creation waits for the MKDIR.
        let wants_parent_mkdir = matches!(kind, NodeKind::Dst)
            || (kind == NodeKind::Src && op.op_type == super::OpType::Mkdir);
        if wants_parent_mkdir {
            if let Some(parent_path) = path_parent(target.single_path()) {
                if let Some(mkdir_uid) =
                    find_pending_create_for_path(inner, target.device_uid(), parent_path, op.op_uid)
                {
                    inner.link(mkdir_uid, uid);
                    linked_parent = true;
                }
            }
        }

        // The symmetric case: a creation enqueued after ops that land inside
        // it. Those pending nodes re-link under us so the directory still
        // exists before anything is placed in it.
        let creates_target = match op.op_type {
            super::OpType::Mkdir => kind == NodeKind::Src,
            super::OpType::StartDirCp => kind == NodeKind::Dst,
            _ => false,
        };
        if creates_target {
            for dependent in find_pending_creations_inside(inner, &target, op.op_uid) {
                inner.link(uid, dependent);
            }
        }

        // A directory-copy finish runs only after everything staged into the
        // new directory has landed.
        if kind == NodeKind::Dst && op.op_type == super::OpType::FinishDirCp {
            for dependent in find_pending_creations_inside(inner, &target, op.op_uid) {
                inner.link(dependent, uid);
                linked_parent = true;
            }
        }

        // Rule 4: RM inversion. Pending ops on our contents (children's RMs,
        // the source sides of moves out of us) become our parents; our own
        // parent directory's RM becomes our child.
        if kind == NodeKind::Rm {
            let child_ops = find_pending_ops_on_children_of(inner, &target, op.op_uid);
            for child_op in child_ops {
                inner.link(child_op, uid);
                linked_parent = true;
            }
            if let Some(parent_rm_uid) = find_pending_rm_of_parent(inner, &target, op.op_uid) {
                inner.link(uid, parent_rm_uid);
            }
        }

        // Rule 5: otherwise hang off the root.
        if !linked_parent {
            inner.link(ROOT_GRAPH_UID, uid);
        }

        Ok(())
    }

    /// Blocking fetch of the next runnable op. Returns None on shutdown.
    pub async fn next_command(&self) -> Option<Arc<Op>> {
        loop {
            if self.was_shutdown.load(Ordering::SeqCst) {
                return None;
            }
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(op) = inner.find_ready() {
                    return Some(op);
                }
            }
            let notified = self.notify.notified();
            if self.was_shutdown.load(Ordering::SeqCst) {
                return None;
            }
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(op) = inner.find_ready() {
                    return Some(op);
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant; used by tests and the status surface.
    pub fn try_next_command(&self) -> Option<Arc<Op>> {
        self.inner.lock().unwrap().find_ready()
    }

    /// Mark an op finished. On success its nodes complete and children
    /// unblock; on failure the nodes stay incomplete so every dependent
    /// remains blocked.
    pub fn mark_completed(&self, op_uid: Uid, status: OpStatus) {
        let mut inner = self.inner.lock().unwrap();
        let Some(node_uids) = inner.ops.get(&op_uid).cloned() else {
            warn!("mark_completed for unknown op {op_uid}");
            return;
        };

        inner.release_targets(&node_uids);
        let succeeded = status.is_completed();
        for uid in &node_uids {
            let node = inner.nodes.get_mut(uid).expect("graph node exists");
            if succeeded {
                node.completed = true;
            } else {
                node.failed = true;
            }
        }
        if succeeded {
            for uid in &node_uids {
                if let Some(key) = inner.nodes[uid].target_key() {
                    if let Some(pending) = inner.by_target.get_mut(&key) {
                        pending.retain(|p| p != uid);
                        if pending.is_empty() {
                            inner.by_target.remove(&key);
                        }
                    }
                }
            }
        }
        inner.op_status.insert(op_uid, status);
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn op_status(&self, op_uid: Uid) -> Option<OpStatus> {
        self.inner.lock().unwrap().op_status.get(&op_uid).copied()
    }

    /// (completed, failed, pending) counts for one batch.
    pub fn batch_progress(&self, batch_uid: Uid) -> (usize, usize, usize) {
        let inner = self.inner.lock().unwrap();
        let mut completed = 0;
        let mut failed = 0;
        let mut pending = 0;
        for (op_uid, op) in &inner.op_by_uid {
            if op.batch_uid != batch_uid {
                continue;
            }
            match inner.op_status.get(op_uid) {
                Some(status) if status.is_completed() => completed += 1,
                Some(OpStatus::StoppedOnError) => failed += 1,
                _ => pending += 1,
            }
        }
        (completed, failed, pending)
    }

    pub fn pending_op_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .op_status
            .values()
            .filter(|s| matches!(s, OpStatus::NotStarted | OpStatus::Executing))
            .count()
    }

    /// Longest dependency chain above an op's nodes.
    pub fn level_of(&self, op_uid: Uid) -> Option<usize> {
        let inner = self.inner.lock().unwrap();
        let node_uids = inner.ops.get(&op_uid)?;
        node_uids.iter().map(|uid| inner.level_of(*uid)).max()
    }

    pub fn shutdown(&self) {
        self.was_shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn alloc_uid(&self) -> Uid {
        Uid(self.next_graph_uid.fetch_add(1, Ordering::SeqCst))
    }
}

/// A pending create-type node (MKDIR, or the destination side of a dir
/// copy) whose target directory sits at `path` on `device`.
fn find_pending_create_for_path(
    inner: &GraphInner,
    device: DeviceUid,
    path: &str,
    exclude_op: Uid,
) -> Option<Uid> {
    inner
        .nodes
        .values()
        .filter(|node| !node.completed && !node.failed)
        .filter(|node| {
            node.op
                .as_ref()
                .map(|op| {
                    op.op_uid != exclude_op
                        && match op.op_type {
                            super::OpType::Mkdir => node.kind == NodeKind::Src,
                            super::OpType::StartDirCp => node.kind == NodeKind::Dst,
                            _ => false,
                        }
                })
                .unwrap_or(false)
        })
        .find(|node| {
            node.target()
                .map(|t| t.device_uid() == device && t.identifier().has_path(path))
                .unwrap_or(false)
        })
        .map(|node| node.uid)
}

/// Pending creation-side nodes (copy/move destinations, child mkdirs) whose
/// target sits directly inside the directory at `target`.
fn find_pending_creations_inside(inner: &GraphInner, target: &Node, exclude_op: Uid) -> Vec<Uid> {
    inner
        .nodes
        .values()
        .filter(|node| !node.completed && !node.failed)
        .filter(|node| {
            node.op
                .as_ref()
                .map(|op| {
                    op.op_uid != exclude_op
                        && (node.kind == NodeKind::Dst
                            || (node.kind == NodeKind::Src
                                && op.op_type == super::OpType::Mkdir))
                })
                .unwrap_or(false)
        })
        .filter(|node| {
            node.target()
                .map(|t| {
                    t.device_uid() == target.device_uid()
                        && path_parent(t.single_path())
                            .map(|p| target.identifier().has_path(p))
                            .unwrap_or(false)
                })
                .unwrap_or(false)
        })
        .map(|node| node.uid)
        .collect()
}

/// Pending op nodes whose target is a direct child of `target`. A directory
/// is only removable once every op touching its contents has completed.
fn find_pending_ops_on_children_of(inner: &GraphInner, target: &Node, exclude_op: Uid) -> Vec<Uid> {
    inner
        .nodes
        .values()
        .filter(|node| node.kind != NodeKind::Root && !node.completed && !node.failed)
        .filter(|node| {
            node.op
                .as_ref()
                .map(|op| op.op_uid != exclude_op)
                .unwrap_or(false)
        })
        .filter(|node| {
            node.target()
                .map(|t| {
                    t.device_uid() == target.device_uid()
                        && (t.parent_uids().contains(&target.uid())
                            || path_parent(t.single_path())
                                .map(|p| target.identifier().has_path(p))
                                .unwrap_or(false))
                })
                .unwrap_or(false)
        })
        .map(|node| node.uid)
        .collect()
}

/// The pending RM node (if any) whose target is `target`'s parent directory.
fn find_pending_rm_of_parent(inner: &GraphInner, target: &Node, exclude_op: Uid) -> Option<Uid> {
    inner
        .nodes
        .values()
        .filter(|node| node.kind == NodeKind::Rm && !node.completed && !node.failed)
        .filter(|node| {
            node.op
                .as_ref()
                .map(|op| op.op_uid != exclude_op)
                .unwrap_or(false)
        })
        .find(|node| {
            node.target()
                .map(|t| {
                    t.device_uid() == target.device_uid()
                        && (target.parent_uids().contains(&t.uid())
                            || path_parent(target.single_path())
                                .map(|p| t.identifier().has_path(p))
                                .unwrap_or(false))
                })
                .unwrap_or(false)
        })
        .map(|node| node.uid)
}
