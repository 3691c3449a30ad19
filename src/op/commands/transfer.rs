//! Cross-tree transfer commands
//!
//! Copies between the local and cloud trees. A cross-tree move is the same
//! command with `delete_src_after` set: copy, verify, then drop the source.

use super::cloud as cloud_cmds;
use super::{Command, CommandContext};
use crate::error::{EngineError, EngineResult};
use crate::node::{FileNode, Node, NodeIdentifier, TrashStatus};
use crate::op::{Op, OpResult};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Upload a local file into the cloud tree.
pub struct CopyFileLocalToCloudCommand {
    op: Arc<Op>,
    overwrite: bool,
    delete_src_after: bool,
}

impl CopyFileLocalToCloudCommand {
    pub fn new(op: Arc<Op>, overwrite: bool, delete_src_after: bool) -> Self {
        Self {
            op,
            overwrite,
            delete_src_after,
        }
    }
}

#[async_trait]
impl Command for CopyFileLocalToCloudCommand {
    fn op(&self) -> &Arc<Op> {
        &self.op
    }

    async fn execute(&self, ctx: &CommandContext) -> EngineResult<OpResult> {
        let src = &self.op.src_node;
        let dst = self.op.dst_node.as_ref().expect("copy has dst");
        let src_path = Path::new(src.single_path());
        let store = ctx.cloud_store(dst.device_uid())?;

        if tokio::fs::symlink_metadata(src_path).await.is_err() {
            return Err(EngineError::op_failed(format!(
                "Source vanished: '{}'",
                src_path.display()
            )));
        }

        let src_md5 = match src.md5() {
            Some(md5) => md5.to_string(),
            None => ctx
                .hasher
                .calculate_signatures(src_path)
                .await?
                .md5
                .ok_or_else(|| {
                    EngineError::op_failed(format!("Cannot hash source '{}'", src_path.display()))
                })?,
        };

        if let Some(existing) = store.memory.node_for_path(dst.single_path()) {
            if existing.md5() == Some(src_md5.as_str()) {
                info!(
                    "Cloud destination '{}' already has identical content",
                    dst.single_path()
                );
                let mut result = OpResult::no_op();
                if self.delete_src_after {
                    tokio::fs::remove_file(src_path).await?;
                    result = result.with_remove(src.device_uid(), src.uid());
                }
                return Ok(result);
            }
            if !self.overwrite {
                return Err(EngineError::op_failed(format!(
                    "Cloud destination exists with different content: '{}'",
                    dst.single_path()
                )));
            }
        }

        let parent_id = cloud_cmds::parent_external_id_of(store, dst)?;
        let item = ctx
            .client()?
            .upload_file(src_path, dst.name(), &parent_id)
            .await?;

        if let Some(item_md5) = &item.md5 {
            if *item_md5 != src_md5 {
                return Err(EngineError::op_failed(format!(
                    "Upload hash mismatch: provider has {item_md5}, source is {src_md5}"
                )));
            }
        }
        debug!("Uploaded '{}' -> '{}'", src_path.display(), dst.single_path());

        let uid = store.registry.uid_for_external_id(&item.id, Some(dst.uid()));
        let node = Node::File(FileNode {
            identifier: NodeIdentifier::with_paths(dst.device_uid(), uid, dst.path_list().to_vec()),
            parent_uids: dst.parent_uids().to_vec(),
            size_bytes: item.size_bytes,
            md5: Some(src_md5),
            sha256: None,
            sync_ts: crate::node::now_ts(),
            modify_ts: item.modify_ts,
            change_ts: item.create_ts,
            trashed: TrashStatus::NotTrashed,
            live: true,
            external_id: Some(item.id.clone()),
            version: item.version,
        });

        let mut result = OpResult::ok().with_upsert(node);
        if self.delete_src_after {
            tokio::fs::remove_file(src_path).await?;
            result = result.with_remove(src.device_uid(), src.uid());
        }
        Ok(result)
    }
}

/// Download a cloud file into the local tree, staged and verified.
pub struct CopyFileCloudToLocalCommand {
    op: Arc<Op>,
    overwrite: bool,
    delete_src_after: bool,
}

impl CopyFileCloudToLocalCommand {
    pub fn new(op: Arc<Op>, overwrite: bool, delete_src_after: bool) -> Self {
        Self {
            op,
            overwrite,
            delete_src_after,
        }
    }
}

#[async_trait]
impl Command for CopyFileCloudToLocalCommand {
    fn op(&self) -> &Arc<Op> {
        &self.op
    }

    async fn execute(&self, ctx: &CommandContext) -> EngineResult<OpResult> {
        let src = &self.op.src_node;
        let dst = self.op.dst_node.as_ref().expect("copy has dst");
        let dst_path = Path::new(dst.single_path());

        if tokio::fs::symlink_metadata(dst_path).await.is_ok() {
            let dst_sig = ctx.hasher.calculate_signatures(dst_path).await?;
            if dst_sig.md5.as_deref() == src.md5() && src.md5().is_some() {
                info!(
                    "Destination '{}' already has identical content",
                    dst_path.display()
                );
                let mut result = OpResult::no_op();
                result = result.with_upsert(local_node_with_hash(ctx, dst, src.md5()).await?);
                if self.delete_src_after {
                    result = self.delete_cloud_src(ctx, result).await?;
                }
                return Ok(result);
            }
            if !self.overwrite {
                return Err(EngineError::op_failed(format!(
                    "Destination exists with different content: '{}'",
                    dst_path.display()
                )));
            }
        }

        let src_id = src.external_id().ok_or_else(|| {
            EngineError::invariant(format!("Cloud node without external id: {}", src.identifier()))
        })?;

        let staged = ctx.staging.staging_file_for(dst_path, self.op.op_uid)?;
        ctx.client()?.download_file(src_id, &staged).await?;

        let staged_sig = ctx.hasher.calculate_signatures(&staged).await?;
        if src.md5().is_some() && staged_sig.md5.as_deref() != src.md5() {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(EngineError::op_failed(format!(
                "Downloaded content hash mismatch for '{}'",
                dst_path.display()
            )));
        }

        tokio::fs::rename(&staged, dst_path).await?;
        debug!("Downloaded '{src_id}' -> '{}'", dst_path.display());

        let mut result =
            OpResult::ok().with_upsert(local_node_with_hash(ctx, dst, staged_sig.md5.as_deref()).await?);
        if self.delete_src_after {
            result = self.delete_cloud_src(ctx, result).await?;
        }
        Ok(result)
    }
}

impl CopyFileCloudToLocalCommand {
    async fn delete_cloud_src(
        &self,
        ctx: &CommandContext,
        result: OpResult,
    ) -> EngineResult<OpResult> {
        let src = &self.op.src_node;
        let src_id = src.external_id().ok_or_else(|| {
            EngineError::invariant(format!("Cloud node without external id: {}", src.identifier()))
        })?;
        ctx.client()?.delete_item(src_id, false).await?;
        Ok(result.with_remove(src.device_uid(), src.uid()))
    }
}

async fn local_node_with_hash(
    ctx: &CommandContext,
    dst: &Node,
    md5: Option<&str>,
) -> EngineResult<Node> {
    let store = ctx.local_store(dst.device_uid())?;
    let mut node = store.build_file_node(dst.single_path(), None).await?;
    if let Node::File(file) = &mut node {
        file.md5 = md5.map(str::to_string);
    }
    Ok(node)
}
