//! Diff → apply → re-diff round trip

mod helpers;

use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;
use treesync::diff::{Category, DiffOptions};
use treesync::Engine;

async fn two_trees(
    left: &[(&str, &[u8])],
    right: &[(&str, &[u8])],
) -> (TempDir, TempDir, TempDir, Arc<Engine>, String, String) {
    let data_dir = TempDir::new().unwrap();
    let left_dir = TempDir::new().unwrap();
    let right_dir = TempDir::new().unwrap();
    for (dir, files) in [(&left_dir, left), (&right_dir, right)] {
        for (rel, content) in &*files {
            let path = dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
        }
    }
    let left_root = left_dir.path().to_string_lossy().to_string();
    let right_root = right_dir.path().to_string_lossy().to_string();

    let engine = Engine::new(Some(data_dir.path().to_path_buf())).await.unwrap();
    engine.scan_local(&left_root).await.unwrap();
    engine.scan_local(&right_root).await.unwrap();

    (data_dir, left_dir, right_dir, engine, left_root, right_root)
}

#[tokio::test]
async fn applying_the_selected_addition_clears_it_from_the_diff() {
    let (_d, _l, _r, engine, left_root, right_root) = two_trees(
        &[("common.txt", b"same".as_slice()), ("only_left.txt", b"extra".as_slice())],
        &[("common.txt", b"same".as_slice())],
    )
    .await;

    let options = DiffOptions {
        compare_paths_also: true,
        ..Default::default()
    };
    let before = engine
        .diff_trees(&left_root, &right_root, options)
        .await
        .unwrap();

    // One ADDED on the left: only_left.txt.
    let added: Vec<_> = before
        .left
        .entries
        .iter()
        .filter(|e| e.category == Category::Added)
        .collect();
    assert_eq!(added.len(), 1);
    let src = engine
        .local_store_for_path(&left_root)
        .await
        .unwrap()
        .node_for_path(added[0].node.identifier.single_path())
        .unwrap();

    // Select it: copy left → right at the remapped path.
    let right_store = engine.local_store_for_path(&right_root).await.unwrap();
    let mut batch = engine.new_batch();
    engine
        .stage_cp(
            &mut batch,
            src,
            right_store.device.uid,
            &format!("{right_root}/only_left.txt"),
            false,
        )
        .await
        .unwrap();
    let (completed, failed, pending) = engine.apply_batch(&batch).await.unwrap();
    assert_eq!((completed, failed, pending), (1, 0, 0));

    // The applied entry is gone from a fresh diff.
    let after = engine
        .diff_trees(&left_root, &right_root, options)
        .await
        .unwrap();
    assert!(
        after
            .left
            .entries
            .iter()
            .all(|e| e.category != Category::Added),
        "applied selection must no longer be reported"
    );
    assert!(
        after
            .right
            .entries
            .iter()
            .all(|e| e.category != Category::Deleted),
        "ghost deletion must disappear once the copy exists"
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn applying_a_deletion_clears_the_ghost() {
    let (_d, _l, _r, engine, left_root, right_root) = two_trees(
        &[("kept.txt", b"kept".as_slice()), ("doomed.txt", b"doomed".as_slice())],
        &[("kept.txt", b"kept".as_slice())],
    )
    .await;

    let options = DiffOptions {
        compare_paths_also: true,
        ..Default::default()
    };

    // Resolve the one-sided file by deleting it on the left instead.
    let left_store = engine.local_store_for_path(&left_root).await.unwrap();
    let doomed = left_store
        .node_for_path(&format!("{left_root}/doomed.txt"))
        .unwrap();
    let mut batch = engine.new_batch();
    engine.stage_rm(&mut batch, doomed);
    let (completed, failed, pending) = engine.apply_batch(&batch).await.unwrap();
    assert_eq!((completed, failed, pending), (1, 0, 0));

    let after = engine
        .diff_trees(&left_root, &right_root, options)
        .await
        .unwrap();
    let non_unchanged: Vec<_> = after
        .left
        .entries
        .iter()
        .chain(&after.right.entries)
        .filter(|e| e.category != Category::Unchanged)
        .collect();
    assert!(
        non_unchanged.is_empty(),
        "trees converged; expected only unchanged entries, got {non_unchanged:?}"
    );

    engine.shutdown().await;
}
