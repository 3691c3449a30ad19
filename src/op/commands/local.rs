//! Commands that touch only the local tree

use super::{Command, CommandContext};
use crate::error::{EngineError, EngineResult};
use crate::node::Node;
use crate::op::{Op, OpResult};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Delete the target file or (empty) directory.
pub struct DeleteLocalNodeCommand {
    op: Arc<Op>,
    to_trash: bool,
}

impl DeleteLocalNodeCommand {
    pub fn new(op: Arc<Op>, to_trash: bool) -> Self {
        Self { op, to_trash }
    }
}

#[async_trait]
impl Command for DeleteLocalNodeCommand {
    fn op(&self) -> &Arc<Op> {
        &self.op
    }

    async fn execute(&self, _ctx: &CommandContext) -> EngineResult<OpResult> {
        if self.to_trash {
            return Err(EngineError::op_failed(
                "Trash is not supported for local nodes",
            ));
        }
        let src = &self.op.src_node;
        let path = Path::new(src.single_path());

        if tokio::fs::symlink_metadata(path).await.is_err() {
            // Index said it exists, live tree disagrees; live state wins.
            warn!("'{}' already gone; treating RM as done", path.display());
            return Ok(OpResult::no_op().with_remove(src.device_uid(), src.uid()));
        }

        if src.is_dir() {
            // Contents were removed by our dependency ops; anything left
            // appeared concurrently, and the error surfaces as-is.
            tokio::fs::remove_dir(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
        debug!("Removed '{}'", path.display());
        Ok(OpResult::ok().with_remove(src.device_uid(), src.uid()))
    }
}

/// Create the target directory.
pub struct CreateLocalDirCommand {
    op: Arc<Op>,
}

impl CreateLocalDirCommand {
    pub fn new(op: Arc<Op>) -> Self {
        Self { op }
    }
}

#[async_trait]
impl Command for CreateLocalDirCommand {
    fn op(&self) -> &Arc<Op> {
        &self.op
    }

    async fn execute(&self, ctx: &CommandContext) -> EngineResult<OpResult> {
        let src = &self.op.src_node;
        let path = src.single_path();
        tokio::fs::create_dir_all(path).await?;

        let store = ctx.local_store(src.device_uid())?;
        let node = store.build_dir_node(path, true);
        Ok(OpResult::ok().with_upsert(node))
    }
}

/// Copy a file within one local tree, staged and verified.
pub struct CopyFileLocalToLocalCommand {
    op: Arc<Op>,
    overwrite: bool,
}

impl CopyFileLocalToLocalCommand {
    pub fn new(op: Arc<Op>, overwrite: bool) -> Self {
        Self { op, overwrite }
    }
}

#[async_trait]
impl Command for CopyFileLocalToLocalCommand {
    fn op(&self) -> &Arc<Op> {
        &self.op
    }

    async fn execute(&self, ctx: &CommandContext) -> EngineResult<OpResult> {
        let src = &self.op.src_node;
        let dst = self.op.dst_node.as_ref().expect("copy has dst");
        let src_path = Path::new(src.single_path());
        let dst_path = Path::new(dst.single_path());

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

        if tokio::fs::symlink_metadata(dst_path).await.is_ok() {
            let dst_sig = ctx.hasher.calculate_signatures(dst_path).await?;
            if dst_sig.md5.as_deref() == Some(src_md5.as_str()) {
                info!(
                    "Destination '{}' already has identical content",
                    dst_path.display()
                );
                let node = hashed_file_node(ctx, dst, &src_md5).await?;
                return Ok(OpResult::no_op().with_upsert(node));
            }
            if !self.overwrite {
                return Err(EngineError::op_failed(format!(
                    "Destination exists with different content: '{}'",
                    dst_path.display()
                )));
            }
        }

        let staged = ctx.staging.staging_file_for(dst_path, self.op.op_uid)?;
        tokio::fs::copy(src_path, &staged).await?;

        let staged_sig = ctx.hasher.calculate_signatures(&staged).await?;
        if staged_sig.md5.as_deref() != Some(src_md5.as_str()) {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(EngineError::op_failed(format!(
                "Staged copy hash mismatch for '{}'",
                dst_path.display()
            )));
        }

        tokio::fs::rename(&staged, dst_path).await?;
        debug!("Copied '{}' -> '{}'", src_path.display(), dst_path.display());

        let node = hashed_file_node(ctx, dst, &src_md5).await?;
        Ok(OpResult::ok().with_upsert(node))
    }
}

/// Move a file within one local tree.
pub struct MoveFileLocalToLocalCommand {
    op: Arc<Op>,
    overwrite: bool,
}

impl MoveFileLocalToLocalCommand {
    pub fn new(op: Arc<Op>, overwrite: bool) -> Self {
        Self { op, overwrite }
    }
}

#[async_trait]
impl Command for MoveFileLocalToLocalCommand {
    fn op(&self) -> &Arc<Op> {
        &self.op
    }

    async fn execute(&self, ctx: &CommandContext) -> EngineResult<OpResult> {
        let src = &self.op.src_node;
        let dst = self.op.dst_node.as_ref().expect("move has dst");
        let src_path = Path::new(src.single_path());
        let dst_path = Path::new(dst.single_path());

        let src_exists = tokio::fs::symlink_metadata(src_path).await.is_ok();
        let dst_exists = tokio::fs::symlink_metadata(dst_path).await.is_ok();

        if !src_exists {
            if dst_exists {
                let dst_sig = ctx.hasher.calculate_signatures(dst_path).await?;
                if dst_sig.md5.as_deref() == src.md5() && src.md5().is_some() {
                    // The move already happened outside of us.
                    let md5 = dst_sig.md5.clone().unwrap_or_default();
                    let node = hashed_file_node(ctx, dst, &md5).await?;
                    return Ok(OpResult::no_op()
                        .with_upsert(node)
                        .with_remove(src.device_uid(), src.uid()));
                }
            }
            return Err(EngineError::op_failed(format!(
                "Source vanished: '{}'",
                src_path.display()
            )));
        }

        if dst_exists {
            let dst_sig = ctx.hasher.calculate_signatures(dst_path).await?;
            if dst_sig.md5.as_deref() == src.md5() && src.md5().is_some() {
                tokio::fs::remove_file(src_path).await?;
                let md5 = dst_sig.md5.clone().unwrap_or_default();
                let node = hashed_file_node(ctx, dst, &md5).await?;
                return Ok(OpResult::no_op()
                    .with_upsert(node)
                    .with_remove(src.device_uid(), src.uid()));
            }
            if !self.overwrite {
                return Err(EngineError::op_failed(format!(
                    "Destination exists with different content: '{}'",
                    dst_path.display()
                )));
            }
        }

        // Register before acting so the watcher drops the resulting events.
        ctx.expected_moves
            .register(src.single_path(), dst.single_path());

        match tokio::fs::rename(src_path, dst_path).await {
            Ok(()) => {}
            Err(err) if is_cross_device(&err) => {
                // Different volume: stage on the destination volume, verify,
                // rename into place, then drop the source.
                let staged = ctx.staging.staging_file_for(dst_path, self.op.op_uid)?;
                tokio::fs::copy(src_path, &staged).await?;
                let staged_sig = ctx.hasher.calculate_signatures(&staged).await?;
                if src.md5().is_some() && staged_sig.md5.as_deref() != src.md5() {
                    let _ = tokio::fs::remove_file(&staged).await;
                    return Err(EngineError::op_failed(format!(
                        "Staged copy hash mismatch for '{}'",
                        dst_path.display()
                    )));
                }
                tokio::fs::rename(&staged, dst_path).await?;
                tokio::fs::remove_file(src_path).await?;
            }
            Err(err) => return Err(err.into()),
        }
        debug!("Moved '{}' -> '{}'", src_path.display(), dst_path.display());

        let md5 = src.md5().unwrap_or_default().to_string();
        let node = hashed_file_node(ctx, dst, &md5).await?;
        Ok(OpResult::ok()
            .with_upsert(node)
            .with_remove(src.device_uid(), src.uid()))
    }
}

/// Create the destination directory of a directory copy, ahead of its
/// contents.
pub struct StartCopyToLocalDirCommand {
    op: Arc<Op>,
}

impl StartCopyToLocalDirCommand {
    pub fn new(op: Arc<Op>) -> Self {
        Self { op }
    }
}

#[async_trait]
impl Command for StartCopyToLocalDirCommand {
    fn op(&self) -> &Arc<Op> {
        &self.op
    }

    async fn execute(&self, ctx: &CommandContext) -> EngineResult<OpResult> {
        let dst = self.op.dst_node.as_ref().expect("dir copy has dst");
        tokio::fs::create_dir_all(dst.single_path()).await?;
        let store = ctx.local_store(dst.device_uid())?;
        let node = store.build_dir_node(dst.single_path(), false);
        Ok(OpResult::ok().with_upsert(node))
    }
}

/// Finish a directory copy: carry the source directory's permissions over
/// once the contents have landed.
pub struct FinishCopyToLocalDirCommand {
    op: Arc<Op>,
}

impl FinishCopyToLocalDirCommand {
    pub fn new(op: Arc<Op>) -> Self {
        Self { op }
    }
}

#[async_trait]
impl Command for FinishCopyToLocalDirCommand {
    fn op(&self) -> &Arc<Op> {
        &self.op
    }

    async fn execute(&self, ctx: &CommandContext) -> EngineResult<OpResult> {
        let src = &self.op.src_node;
        let dst = self.op.dst_node.as_ref().expect("dir copy has dst");

        if let Ok(meta) = tokio::fs::metadata(src.single_path()).await {
            if let Err(err) =
                tokio::fs::set_permissions(dst.single_path(), meta.permissions()).await
            {
                warn!(
                    "Could not copy permissions onto '{}': {err}",
                    dst.single_path()
                );
            }
        }

        let store = ctx.local_store(dst.device_uid())?;
        let node = store.build_dir_node(dst.single_path(), true);
        Ok(OpResult::ok().with_upsert(node))
    }
}

/// Stat the finished destination and attach the already-known hash, so the
/// index entry is complete without a second read of the file.
async fn hashed_file_node(
    ctx: &CommandContext,
    dst: &Node,
    md5: &str,
) -> EngineResult<Node> {
    let store = ctx.local_store(dst.device_uid())?;
    let mut node = store.build_file_node(dst.single_path(), None).await?;
    if let Node::File(file) = &mut node {
        file.md5 = Some(md5.to_string());
    }
    Ok(node)
}

fn is_cross_device(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::EXDEV)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}
