//! Operation model
//!
//! An op is one unit of intended change against a target tree. Ops with a
//! source and a destination (copies, moves) carry both nodes. Ops sharing a
//! `batch_uid` were staged together and are accounted for as a unit.
//! Pending-state truth lives in the op graph; ops reference existing node
//! records instead of growing a parallel node taxonomy.

pub mod commands;
pub mod executor;
pub mod graph;
pub mod staging;

use crate::device::{DeviceUid, Uid};
use crate::node::Node;
use serde::{Deserialize, Serialize};

/// The kinds of change an op can request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
pub enum OpType {
    /// Remove the src node
    Rm,
    /// Create the src directory
    Mkdir,
    /// Copy src to dst; fails if dst exists with different content
    Cp,
    /// Copy src onto an existing dst, overwriting
    CpOnto,
    /// Move src to dst
    Mv,
    /// Move src onto an existing dst, overwriting
    MvOnto,
    /// Create the dst directory of a directory copy, before its contents
    StartDirCp,
    /// Finish a directory copy after its contents (copy metadata, and for
    /// a directory move remove the source)
    FinishDirCp,
}

impl OpType {
    pub fn has_dst(&self) -> bool {
        matches!(
            self,
            OpType::Cp
                | OpType::CpOnto
                | OpType::Mv
                | OpType::MvOnto
                | OpType::StartDirCp
                | OpType::FinishDirCp
        )
    }

    pub fn is_remove(&self) -> bool {
        matches!(self, OpType::Rm)
    }
}

/// Execution status of an op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    NotStarted,
    Executing,
    CompletedOk,
    /// Nothing needed doing (e.g. identical destination already present)
    CompletedNoOp,
    StoppedOnError,
}

impl OpStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, OpStatus::CompletedOk | OpStatus::CompletedNoOp)
    }
}

/// What an executed op did: final status plus the index corrections the
/// engine must apply.
#[derive(Debug, Clone)]
pub struct OpResult {
    pub status: OpStatus,
    pub error: Option<String>,
    /// Nodes to upsert into the target tree's index
    pub to_upsert: Vec<Node>,
    /// Nodes to remove from their tree's index
    pub to_remove: Vec<(DeviceUid, Uid)>,
}

impl OpResult {
    pub fn ok() -> Self {
        Self {
            status: OpStatus::CompletedOk,
            error: None,
            to_upsert: Vec::new(),
            to_remove: Vec::new(),
        }
    }

    pub fn no_op() -> Self {
        Self {
            status: OpStatus::CompletedNoOp,
            error: None,
            to_upsert: Vec::new(),
            to_remove: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: OpStatus::StoppedOnError,
            error: Some(message.into()),
            to_upsert: Vec::new(),
            to_remove: Vec::new(),
        }
    }

    pub fn with_upsert(mut self, node: Node) -> Self {
        self.to_upsert.push(node);
        self
    }

    pub fn with_remove(mut self, device_uid: DeviceUid, uid: Uid) -> Self {
        self.to_remove.push((device_uid, uid));
        self
    }
}

/// One staged operation.
#[derive(Debug, Clone)]
pub struct Op {
    pub op_uid: Uid,
    pub batch_uid: Uid,
    pub op_type: OpType,
    pub src_node: Node,
    pub dst_node: Option<Node>,
}

impl Op {
    pub fn new(op_uid: Uid, batch_uid: Uid, op_type: OpType, src_node: Node) -> Self {
        debug_assert!(!op_type.has_dst());
        Self {
            op_uid,
            batch_uid,
            op_type,
            src_node,
            dst_node: None,
        }
    }

    pub fn with_dst(
        op_uid: Uid,
        batch_uid: Uid,
        op_type: OpType,
        src_node: Node,
        dst_node: Node,
    ) -> Self {
        debug_assert!(op_type.has_dst());
        Self {
            op_uid,
            batch_uid,
            op_type,
            src_node,
            dst_node: Some(dst_node),
        }
    }

    pub fn has_dst(&self) -> bool {
        self.dst_node.is_some()
    }

    /// Whether src and dst live on the same device.
    pub fn is_same_tree(&self) -> bool {
        match &self.dst_node {
            Some(dst) => dst.device_uid() == self.src_node.device_uid(),
            None => true,
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.dst_node {
            Some(dst) => write!(
                f,
                "{} op={} batch={} src='{}' dst='{}'",
                self.op_type,
                self.op_uid,
                self.batch_uid,
                self.src_node.single_path(),
                dst.single_path()
            ),
            None => write!(
                f,
                "{} op={} batch={} tgt='{}'",
                self.op_type,
                self.op_uid,
                self.batch_uid,
                self.src_node.single_path()
            ),
        }
    }
}

/// A set of ops staged together.
#[derive(Debug, Clone)]
pub struct Batch {
    pub batch_uid: Uid,
    pub ops: Vec<Op>,
}

impl Batch {
    pub fn new(batch_uid: Uid) -> Self {
        Self {
            batch_uid,
            ops: Vec::new(),
        }
    }
}
