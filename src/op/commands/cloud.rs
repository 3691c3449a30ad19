//! Commands that touch only the cloud tree

use super::{Command, CommandContext};
use crate::cloud::CloudItem;
use crate::device::Uid;
use crate::error::{EngineError, EngineResult};
use crate::node::{DirNode, FileNode, Node, NodeIdentifier, TrashStatus};
use crate::op::{Op, OpResult};
use crate::store::CloudTreeStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Delete (or trash) the target cloud item.
pub struct DeleteCloudNodeCommand {
    op: Arc<Op>,
    to_trash: bool,
}

impl DeleteCloudNodeCommand {
    pub fn new(op: Arc<Op>, to_trash: bool) -> Self {
        Self { op, to_trash }
    }
}

#[async_trait]
impl Command for DeleteCloudNodeCommand {
    fn op(&self) -> &Arc<Op> {
        &self.op
    }

    async fn execute(&self, ctx: &CommandContext) -> EngineResult<OpResult> {
        let src = &self.op.src_node;
        let external_id = require_external_id(src)?;
        ctx.client()?.delete_item(external_id, self.to_trash).await?;
        debug!("Deleted cloud item {external_id} (to_trash={})", self.to_trash);

        if self.to_trash {
            let mut trashed = src.clone();
            trashed.set_trashed(TrashStatus::ExplicitlyTrashed);
            Ok(OpResult::ok().with_upsert(trashed))
        } else {
            Ok(OpResult::ok().with_remove(src.device_uid(), src.uid()))
        }
    }
}

/// Create the target folder.
pub struct CreateCloudFolderCommand {
    op: Arc<Op>,
}

impl CreateCloudFolderCommand {
    pub fn new(op: Arc<Op>) -> Self {
        Self { op }
    }
}

#[async_trait]
impl Command for CreateCloudFolderCommand {
    fn op(&self) -> &Arc<Op> {
        &self.op
    }

    async fn execute(&self, ctx: &CommandContext) -> EngineResult<OpResult> {
        let src = &self.op.src_node;
        let store = ctx.cloud_store(src.device_uid())?;
        let parent_id = parent_external_id_of(store, src)?;

        let item = ctx.client()?.create_folder(src.name(), &parent_id).await?;
        // Bind the provider id to the uid the op was staged with.
        store
            .registry
            .uid_for_external_id(&item.id, Some(src.uid()));

        let node = Node::Dir(DirNode {
            identifier: src.identifier().clone(),
            parent_uids: src.parent_uids().to_vec(),
            trashed: TrashStatus::NotTrashed,
            live: true,
            all_children_fetched: true,
            sync_ts: crate::node::now_ts(),
            external_id: Some(item.id),
        });
        Ok(OpResult::ok().with_upsert(node))
    }
}

/// Server-side copy of a file within the cloud tree.
pub struct CopyFileWithinCloudCommand {
    op: Arc<Op>,
    overwrite: bool,
}

impl CopyFileWithinCloudCommand {
    pub fn new(op: Arc<Op>, overwrite: bool) -> Self {
        Self { op, overwrite }
    }
}

#[async_trait]
impl Command for CopyFileWithinCloudCommand {
    fn op(&self) -> &Arc<Op> {
        &self.op
    }

    async fn execute(&self, ctx: &CommandContext) -> EngineResult<OpResult> {
        let src = &self.op.src_node;
        let dst = self.op.dst_node.as_ref().expect("copy has dst");
        let store = ctx.cloud_store(dst.device_uid())?;

        if let Some(existing) = store.memory.node_for_path(dst.single_path()) {
            if existing.md5() == src.md5() && src.md5().is_some() {
                info!(
                    "Cloud destination '{}' already has identical content",
                    dst.single_path()
                );
                return Ok(OpResult::no_op());
            }
            if !self.overwrite {
                return Err(EngineError::op_failed(format!(
                    "Cloud destination exists with different content: '{}'",
                    dst.single_path()
                )));
            }
        }

        let src_id = require_external_id(src)?;
        let parent_id = parent_external_id_of(store, dst)?;
        let item = ctx
            .client()?
            .copy_item(src_id, &parent_id, dst.name())
            .await?;
        verify_item_hash(&item, src)?;

        let node = file_node_from_item(store, dst, &item)?;
        Ok(OpResult::ok().with_upsert(node))
    }
}

/// Re-parent / rename a file within the cloud tree. The item keeps its
/// provider id, so the node keeps its uid.
pub struct MoveFileWithinCloudCommand {
    op: Arc<Op>,
    overwrite: bool,
}

impl MoveFileWithinCloudCommand {
    pub fn new(op: Arc<Op>, overwrite: bool) -> Self {
        Self { op, overwrite }
    }
}

#[async_trait]
impl Command for MoveFileWithinCloudCommand {
    fn op(&self) -> &Arc<Op> {
        &self.op
    }

    async fn execute(&self, ctx: &CommandContext) -> EngineResult<OpResult> {
        let src = &self.op.src_node;
        let dst = self.op.dst_node.as_ref().expect("move has dst");
        let store = ctx.cloud_store(src.device_uid())?;

        if let Some(existing) = store.memory.node_for_path(dst.single_path()) {
            if existing.uid() != src.uid() && !self.overwrite {
                return Err(EngineError::op_failed(format!(
                    "Cloud destination occupied: '{}'",
                    dst.single_path()
                )));
            }
        }

        let src_id = require_external_id(src)?;
        let old_parent_id = parent_external_id_of(store, src)?;
        let new_parent_id = parent_external_id_of(store, dst)?;
        let item = ctx
            .client()?
            .move_item(src_id, &old_parent_id, &new_parent_id, dst.name())
            .await?;

        // Same item, new place: the node keeps the source uid.
        let mut moved = src.clone();
        moved.identifier_mut().path_list = dst.path_list().to_vec();
        moved.set_parent_uids(dst.parent_uids().to_vec());
        if let Node::File(file) = &mut moved {
            file.sync_ts = crate::node::now_ts();
            file.version = item.version;
        }
        Ok(OpResult::ok().with_upsert(moved))
    }
}

/// Create the destination folder of a directory copy ahead of its contents.
pub struct StartCopyToCloudFolderCommand {
    op: Arc<Op>,
}

impl StartCopyToCloudFolderCommand {
    pub fn new(op: Arc<Op>) -> Self {
        Self { op }
    }
}

#[async_trait]
impl Command for StartCopyToCloudFolderCommand {
    fn op(&self) -> &Arc<Op> {
        &self.op
    }

    async fn execute(&self, ctx: &CommandContext) -> EngineResult<OpResult> {
        let dst = self.op.dst_node.as_ref().expect("dir copy has dst");
        let store = ctx.cloud_store(dst.device_uid())?;
        let parent_id = parent_external_id_of(store, dst)?;

        let item = ctx.client()?.create_folder(dst.name(), &parent_id).await?;
        store
            .registry
            .uid_for_external_id(&item.id, Some(dst.uid()));

        let node = Node::Dir(DirNode {
            identifier: dst.identifier().clone(),
            parent_uids: dst.parent_uids().to_vec(),
            trashed: TrashStatus::NotTrashed,
            live: true,
            all_children_fetched: false,
            sync_ts: crate::node::now_ts(),
            external_id: Some(item.id),
        });
        Ok(OpResult::ok().with_upsert(node))
    }
}

/// Mark a directory copy complete once the contents have landed.
pub struct FinishCopyToCloudFolderCommand {
    op: Arc<Op>,
}

impl FinishCopyToCloudFolderCommand {
    pub fn new(op: Arc<Op>) -> Self {
        Self { op }
    }
}

#[async_trait]
impl Command for FinishCopyToCloudFolderCommand {
    fn op(&self) -> &Arc<Op> {
        &self.op
    }

    async fn execute(&self, ctx: &CommandContext) -> EngineResult<OpResult> {
        let dst = self.op.dst_node.as_ref().expect("dir copy has dst");
        let store = ctx.cloud_store(dst.device_uid())?;

        let mut node = match store.memory.get_node(dst.uid()) {
            Some(node) => node,
            None => dst.clone(),
        };
        if let Node::Dir(dir) = &mut node {
            dir.all_children_fetched = true;
            dir.sync_ts = crate::node::now_ts();
        }
        Ok(OpResult::ok().with_upsert(node))
    }
}

fn require_external_id(node: &Node) -> EngineResult<&str> {
    node.external_id().ok_or_else(|| {
        EngineError::invariant(format!("Cloud node without external id: {}", node.identifier()))
    })
}

/// The provider id of the node's (first) parent, looked up via the registry
/// or the memory index.
pub(crate) fn parent_external_id_of(store: &CloudTreeStore, node: &Node) -> EngineResult<String> {
    let parent_uid = node.first_parent_uid().ok_or_else(|| {
        EngineError::invariant(format!("Cloud node without parent: {}", node.identifier()))
    })?;
    if let Some(id) = store.registry.external_id_for_uid(parent_uid) {
        return Ok(id);
    }
    if let Some(parent) = store.memory.get_node(parent_uid) {
        if let Some(id) = parent.external_id() {
            return Ok(id.to_string());
        }
    }
    Err(EngineError::op_failed(format!(
        "Parent {parent_uid} of '{}' has no provider id yet",
        node.single_path()
    )))
}

fn verify_item_hash(item: &CloudItem, src: &Node) -> EngineResult<()> {
    if let (Some(item_md5), Some(src_md5)) = (&item.md5, src.md5()) {
        if item_md5 != src_md5 {
            return Err(EngineError::op_failed(format!(
                "Provider reported hash {item_md5} but source is {src_md5}"
            )));
        }
    }
    Ok(())
}

/// A file node for the freshly created provider item at the planned
/// destination identity.
fn file_node_from_item(
    store: &CloudTreeStore,
    dst: &Node,
    item: &CloudItem,
) -> EngineResult<Node> {
    let uid: Uid = store.registry.uid_for_external_id(&item.id, Some(dst.uid()));
    Ok(Node::File(FileNode {
        identifier: NodeIdentifier::with_paths(
            dst.device_uid(),
            uid,
            dst.path_list().to_vec(),
        ),
        parent_uids: dst.parent_uids().to_vec(),
        size_bytes: item.size_bytes,
        md5: item.md5.clone(),
        sha256: None,
        sync_ts: crate::node::now_ts(),
        modify_ts: item.modify_ts,
        change_ts: item.create_ts,
        trashed: TrashStatus::NotTrashed,
        live: true,
        external_id: Some(item.id.clone()),
        version: item.version,
    }))
}
