//! Command implementations
//!
//! A command is a tree-type-specific wrapper around an op that knows how to
//! materialize it. The builder dispatches on (op type, source tree type,
//! destination tree type, same-tree) and covers the full table: removes and
//! mkdirs on either tree, copies and moves within a tree, cross-tree copies
//! (a cross-tree move is a copy plus a delete of the source), and the
//! start/finish pair that brackets a directory copy around its contents.

pub mod cloud;
pub mod local;
pub mod transfer;

use super::{Op, OpResult};
use crate::cloud::CloudClient;
use crate::device::{DeviceUid, TreeType};
use crate::error::{EngineError, EngineResult};
use crate::monitor::ExpectedMoves;
use crate::op::staging::StagingArea;
use crate::scan::hasher::ContentHasher;
use crate::store::{CloudTreeStore, LocalTreeStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// State shared by every command execution.
pub struct CommandContext {
    pub local_stores: HashMap<DeviceUid, Arc<LocalTreeStore>>,
    pub cloud_stores: HashMap<DeviceUid, Arc<CloudTreeStore>>,
    pub cloud_client: Option<Arc<dyn CloudClient>>,
    pub staging: StagingArea,
    pub hasher: ContentHasher,
    pub expected_moves: Arc<ExpectedMoves>,
}

impl CommandContext {
    pub fn local_store(&self, device: DeviceUid) -> EngineResult<&Arc<LocalTreeStore>> {
        self.local_stores
            .get(&device)
            .ok_or_else(|| EngineError::invariant(format!("No local store for device {device}")))
    }

    pub fn cloud_store(&self, device: DeviceUid) -> EngineResult<&Arc<CloudTreeStore>> {
        self.cloud_stores
            .get(&device)
            .ok_or_else(|| EngineError::invariant(format!("No cloud store for device {device}")))
    }

    pub fn client(&self) -> EngineResult<&Arc<dyn CloudClient>> {
        self.cloud_client
            .as_ref()
            .ok_or_else(|| EngineError::invariant("No cloud client configured"))
    }
}

/// A platform-specific wrapper around an op that can execute it.
#[async_trait]
pub trait Command: Send + Sync {
    fn op(&self) -> &Arc<Op>;

    /// Brief summary for logs and error surfaces.
    fn description(&self) -> String {
        format!("{}", self.op())
    }

    async fn execute(&self, ctx: &CommandContext) -> EngineResult<OpResult>;
}

/// Build the command for an op, dispatching on op type and tree types. Tree
/// types come from the caller's device registry: a planned destination node
/// has no provider id yet, so the node alone cannot tell which tree it is
/// bound for.
pub fn build_command(
    op: Arc<Op>,
    src_tree: TreeType,
    dst_tree: Option<TreeType>,
) -> EngineResult<Box<dyn Command>> {
    use super::OpType::*;

    let same_tree = op.is_same_tree();

    let command: Box<dyn Command> = match (op.op_type, src_tree, dst_tree, same_tree) {
        (Rm, TreeType::LocalDisk, None, _) => {
            Box::new(local::DeleteLocalNodeCommand::new(op, false))
        }
        (Rm, TreeType::Cloud, None, _) => Box::new(cloud::DeleteCloudNodeCommand::new(op, false)),

        (Mkdir, TreeType::LocalDisk, None, _) => Box::new(local::CreateLocalDirCommand::new(op)),
        (Mkdir, TreeType::Cloud, None, _) => Box::new(cloud::CreateCloudFolderCommand::new(op)),

        (Cp, TreeType::LocalDisk, Some(TreeType::LocalDisk), true) => {
            Box::new(local::CopyFileLocalToLocalCommand::new(op, false))
        }
        (CpOnto, TreeType::LocalDisk, Some(TreeType::LocalDisk), true) => {
            Box::new(local::CopyFileLocalToLocalCommand::new(op, true))
        }
        (Cp, TreeType::Cloud, Some(TreeType::Cloud), true) => {
            Box::new(cloud::CopyFileWithinCloudCommand::new(op, false))
        }
        (CpOnto, TreeType::Cloud, Some(TreeType::Cloud), true) => {
            Box::new(cloud::CopyFileWithinCloudCommand::new(op, true))
        }
        (Cp, TreeType::LocalDisk, Some(TreeType::Cloud), _) => {
            Box::new(transfer::CopyFileLocalToCloudCommand::new(op, false, false))
        }
        (CpOnto, TreeType::LocalDisk, Some(TreeType::Cloud), _) => {
            Box::new(transfer::CopyFileLocalToCloudCommand::new(op, true, false))
        }
        (Cp, TreeType::Cloud, Some(TreeType::LocalDisk), _) => {
            Box::new(transfer::CopyFileCloudToLocalCommand::new(op, false, false))
        }
        (CpOnto, TreeType::Cloud, Some(TreeType::LocalDisk), _) => {
            Box::new(transfer::CopyFileCloudToLocalCommand::new(op, true, false))
        }

        (Mv, TreeType::LocalDisk, Some(TreeType::LocalDisk), true) => {
            Box::new(local::MoveFileLocalToLocalCommand::new(op, false))
        }
        (MvOnto, TreeType::LocalDisk, Some(TreeType::LocalDisk), true) => {
            Box::new(local::MoveFileLocalToLocalCommand::new(op, true))
        }
        (Mv, TreeType::Cloud, Some(TreeType::Cloud), true) => {
            Box::new(cloud::MoveFileWithinCloudCommand::new(op, false))
        }
        (MvOnto, TreeType::Cloud, Some(TreeType::Cloud), true) => {
            Box::new(cloud::MoveFileWithinCloudCommand::new(op, true))
        }
        // A cross-tree move is a copy with the source deleted afterwards.
        (Mv, TreeType::LocalDisk, Some(TreeType::Cloud), _) => {
            Box::new(transfer::CopyFileLocalToCloudCommand::new(op, false, true))
        }
        (MvOnto, TreeType::LocalDisk, Some(TreeType::Cloud), _) => {
            Box::new(transfer::CopyFileLocalToCloudCommand::new(op, true, true))
        }
        (Mv, TreeType::Cloud, Some(TreeType::LocalDisk), _) => {
            Box::new(transfer::CopyFileCloudToLocalCommand::new(op, false, true))
        }
        (MvOnto, TreeType::Cloud, Some(TreeType::LocalDisk), _) => {
            Box::new(transfer::CopyFileCloudToLocalCommand::new(op, true, true))
        }

        (StartDirCp, _, Some(TreeType::LocalDisk), _) => {
            Box::new(local::StartCopyToLocalDirCommand::new(op))
        }
        (StartDirCp, _, Some(TreeType::Cloud), _) => {
            Box::new(cloud::StartCopyToCloudFolderCommand::new(op))
        }
        (FinishDirCp, _, Some(TreeType::LocalDisk), _) => {
            Box::new(local::FinishCopyToLocalDirCommand::new(op))
        }
        (FinishDirCp, _, Some(TreeType::Cloud), _) => {
            Box::new(cloud::FinishCopyToCloudFolderCommand::new(op))
        }

        (op_type, src, dst, same) => {
            return Err(EngineError::invariant(format!(
                "No command for op {op_type} with trees src={src:?} dst={dst:?} same={same}"
            )))
        }
    };

    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Uid;
    use crate::node::{FileNode, Node, NodeIdentifier, TrashStatus};
    use crate::op::OpType;

    fn node(device: i64, uid: i64, path: &str, external: Option<&str>) -> Node {
        Node::File(FileNode {
            identifier: NodeIdentifier::new(DeviceUid(device), Uid(uid), path),
            parent_uids: vec![Uid(1)],
            size_bytes: 0,
            md5: None,
            sha256: None,
            sync_ts: 0,
            modify_ts: 0,
            change_ts: 0,
            trashed: TrashStatus::NotTrashed,
            live: true,
            external_id: external.map(str::to_string),
            version: None,
        })
    }

    #[test]
    fn dispatch_covers_cross_tree_moves() {
        let op = Arc::new(Op::with_dst(
            Uid(10),
            Uid(11),
            OpType::Mv,
            node(1, 2, "/a/x", None),
            node(2, 3, "/drive/x", Some("item-1")),
        ));
        let cmd = build_command(op, TreeType::LocalDisk, Some(TreeType::Cloud)).unwrap();
        assert!(cmd.description().contains("Mv"));
    }

    #[test]
    fn dispatch_rejects_missing_dst() {
        let op = Arc::new(Op {
            op_uid: Uid(10),
            batch_uid: Uid(11),
            op_type: OpType::Cp,
            src_node: node(1, 2, "/a/x", None),
            dst_node: None,
        });
        assert!(build_command(op, TreeType::LocalDisk, None).is_err());
    }
}
