//! Op graph ordering tests

mod helpers;

use pretty_assertions::assert_eq;
use std::sync::Arc;
use treesync::device::{DeviceUid, Uid};
use treesync::node::{DirNode, FileNode, Node, NodeIdentifier, TrashStatus};
use treesync::op::graph::OpGraph;
use treesync::op::{Op, OpStatus, OpType};

fn dir(uid: i64, path: &str, parent: i64) -> Node {
    Node::Dir(DirNode {
        identifier: NodeIdentifier::new(DeviceUid(1), Uid(uid), path),
        parent_uids: vec![Uid(parent)],
        trashed: TrashStatus::NotTrashed,
        live: true,
        all_children_fetched: true,
        sync_ts: 0,
        external_id: None,
    })
}

fn file(uid: i64, path: &str, parent: i64) -> Node {
    Node::File(FileNode {
        identifier: NodeIdentifier::new(DeviceUid(1), Uid(uid), path),
        parent_uids: vec![Uid(parent)],
        size_bytes: 1,
        md5: Some("aa".to_string()),
        sha256: None,
        sync_ts: 0,
        modify_ts: 0,
        change_ts: 0,
        trashed: TrashStatus::NotTrashed,
        live: true,
        external_id: None,
        version: None,
    })
}

fn rm(op_uid: i64, node: Node) -> Op {
    Op::new(Uid(op_uid), Uid(100), OpType::Rm, node)
}

/// Drain runnable ops one at a time, completing each, and return the op uids
/// in execution order.
fn drain(graph: &OpGraph) -> Vec<i64> {
    let mut order = Vec::new();
    while let Some(op) = graph.try_next_command() {
        order.push(op.op_uid.0);
        graph.mark_completed(op.op_uid, OpStatus::CompletedOk);
    }
    order
}

#[test]
fn rm_child_precedes_rm_parent_when_parent_enqueued_first() {
    let graph = OpGraph::new();
    graph.enqueue_op(rm(1, dir(10, "/a/sub", 9))).unwrap();
    graph.enqueue_op(rm(2, file(11, "/a/sub/f.txt", 10))).unwrap();

    assert_eq!(drain(&graph), vec![2, 1]);
}

#[test]
fn rm_child_precedes_rm_parent_when_child_enqueued_first() {
    let graph = OpGraph::new();
    graph.enqueue_op(rm(1, file(11, "/a/sub/f.txt", 10))).unwrap();
    graph.enqueue_op(rm(2, dir(10, "/a/sub", 9))).unwrap();

    assert_eq!(drain(&graph), vec![1, 2]);
}

#[test]
fn rm_of_full_directory_runs_all_children_first() {
    let graph = OpGraph::new();
    // Directory RM enqueued in the middle of its children's RMs.
    graph.enqueue_op(rm(1, file(11, "/a/sub/one", 10))).unwrap();
    graph.enqueue_op(rm(2, file(12, "/a/sub/two", 10))).unwrap();
    graph.enqueue_op(rm(3, dir(10, "/a/sub", 9))).unwrap();
    graph.enqueue_op(rm(4, file(13, "/a/sub/three", 10))).unwrap();

    let order = drain(&graph);
    assert_eq!(order.len(), 4);
    assert_eq!(*order.last().unwrap(), 3, "directory RM must run last");
}

#[test]
fn cp_dst_waits_for_pending_mkdir_of_parent() {
    let graph = OpGraph::new();
    let mkdir = Op::new(Uid(1), Uid(100), OpType::Mkdir, dir(20, "/b/newdir", 19));
    let cp = Op::with_dst(
        Uid(2),
        Uid(100),
        OpType::Cp,
        file(11, "/a/src.txt", 10),
        file(21, "/b/newdir/dst.txt", 20),
    );
    // Enqueue the copy first; it must still wait for the mkdir.
    graph.enqueue_op(cp).unwrap();
    graph.enqueue_op(mkdir).unwrap();

    // Only the mkdir is runnable now.
    let first = graph.try_next_command().expect("mkdir runnable");
    assert_eq!(first.op_type, OpType::Mkdir);
    assert!(graph.try_next_command().is_none());

    graph.mark_completed(first.op_uid, OpStatus::CompletedOk);
    let second = graph.try_next_command().expect("cp unblocked");
    assert_eq!(second.op_type, OpType::Cp);
}

#[test]
fn mutually_exclusive_ops_on_one_target_serialize() {
    let graph = OpGraph::new();
    let target = file(11, "/a/f.txt", 10);
    let mv = Op::with_dst(
        Uid(1),
        Uid(100),
        OpType::Mv,
        target.clone(),
        file(12, "/a/g.txt", 10),
    );
    graph.enqueue_op(mv).unwrap();
    graph.enqueue_op(rm(2, file(12, "/a/g.txt", 10))).unwrap();

    let first = graph.try_next_command().expect("mv runnable");
    assert_eq!(first.op_uid, Uid(1));
    // The RM targets the MV's destination and must wait.
    assert!(graph.try_next_command().is_none());
    graph.mark_completed(first.op_uid, OpStatus::CompletedOk);
    assert_eq!(graph.try_next_command().unwrap().op_uid, Uid(2));
}

#[test]
fn copy_sources_are_reentrant() {
    let graph = OpGraph::new();
    let src = file(11, "/a/f.txt", 10);
    for (op_uid, dst_uid, dst) in [(1, 21, "/b/one"), (2, 22, "/b/two")] {
        graph
            .enqueue_op(Op::with_dst(
                Uid(op_uid),
                Uid(100),
                OpType::Cp,
                src.clone(),
                file(dst_uid, dst, 20),
            ))
            .unwrap();
    }

    // Both copies read the same source and may run concurrently.
    let first = graph.try_next_command().expect("first cp");
    let second = graph.try_next_command().expect("second cp concurrent");
    assert_ne!(first.op_uid, second.op_uid);
}

#[test]
fn failed_op_blocks_dependents() {
    let graph = OpGraph::new();
    graph.enqueue_op(rm(1, file(11, "/a/sub/f.txt", 10))).unwrap();
    graph.enqueue_op(rm(2, dir(10, "/a/sub", 9))).unwrap();

    let first = graph.try_next_command().unwrap();
    assert_eq!(first.op_uid, Uid(1));
    graph.mark_completed(first.op_uid, OpStatus::StoppedOnError);

    // The directory RM depends on the failed child RM and stays blocked.
    assert!(graph.try_next_command().is_none());
    assert_eq!(graph.op_status(Uid(2)), Some(OpStatus::NotStarted));
}

#[test]
fn dir_copy_brackets_its_contents() {
    let graph = OpGraph::new();
    let src_dir = dir(10, "/a/src", 9);
    let dst_dir = dir(20, "/b/dst", 19);

    // Finish gets a lower op uid than the child copy, so a missing edge
    // would let it run before the contents.
    graph
        .enqueue_op(Op::with_dst(
            Uid(1),
            Uid(100),
            OpType::StartDirCp,
            src_dir.clone(),
            dst_dir.clone(),
        ))
        .unwrap();
    graph
        .enqueue_op(Op::with_dst(
            Uid(3),
            Uid(100),
            OpType::Cp,
            file(11, "/a/src/f.txt", 10),
            file(21, "/b/dst/f.txt", 20),
        ))
        .unwrap();
    graph
        .enqueue_op(Op::with_dst(
            Uid(2),
            Uid(100),
            OpType::FinishDirCp,
            src_dir,
            dst_dir,
        ))
        .unwrap();

    assert_eq!(drain(&graph), vec![1, 3, 2]);
}

#[test]
fn rm_waits_for_moves_out_of_the_directory() {
    let graph = OpGraph::new();
    // A move vacating the directory, then the RM of the directory itself.
    graph
        .enqueue_op(Op::with_dst(
            Uid(1),
            Uid(100),
            OpType::Mv,
            file(11, "/a/sub/f.txt", 10),
            file(21, "/b/f.txt", 20),
        ))
        .unwrap();
    graph.enqueue_op(rm(2, dir(10, "/a/sub", 9))).unwrap();

    let first = graph.try_next_command().expect("mv runnable");
    assert_eq!(first.op_uid, Uid(1));
    // The RM must wait until the contents have been moved out.
    assert!(graph.try_next_command().is_none());
    graph.mark_completed(first.op_uid, OpStatus::CompletedOk);
    assert_eq!(graph.try_next_command().unwrap().op_uid, Uid(2));
}

#[tokio::test]
async fn next_command_returns_none_after_shutdown() {
    let graph = Arc::new(OpGraph::new());
    let waiter = {
        let graph = graph.clone();
        tokio::spawn(async move { graph.next_command().await })
    };
    tokio::task::yield_now().await;
    graph.shutdown();
    assert!(waiter.await.unwrap().is_none());
}

#[test]
fn levels_reflect_dependency_depth() {
    let graph = OpGraph::new();
    graph.enqueue_op(rm(1, file(12, "/a/sub/deep/f", 11))).unwrap();
    graph.enqueue_op(rm(2, dir(11, "/a/sub/deep", 10))).unwrap();
    graph.enqueue_op(rm(3, dir(10, "/a/sub", 9))).unwrap();

    assert_eq!(graph.level_of(Uid(1)), Some(1));
    assert_eq!(graph.level_of(Uid(2)), Some(2));
    assert_eq!(graph.level_of(Uid(3)), Some(3));
}
