//! Executor integration tests against real local trees

mod helpers;

use helpers::md5_hex;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use treesync::Engine;

async fn scanned_engine(files: &[(&str, &[u8])]) -> (TempDir, TempDir, std::sync::Arc<Engine>, String) {
    let data_dir = TempDir::new().unwrap();
    let tree_dir = TempDir::new().unwrap();
    for (rel, content) in files {
        let path = tree_dir.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
    }
    let root = tree_dir.path().to_string_lossy().to_string();
    let engine = Engine::new(Some(data_dir.path().to_path_buf())).await.unwrap();
    engine.scan_local(&root).await.unwrap();
    (data_dir, tree_dir, engine, root)
}

#[tokio::test]
async fn copy_batch_copies_and_indexes() {
    let (_data, tree, engine, root) = scanned_engine(&[("src.txt", b"payload".as_slice())]).await;
    let store = engine.local_store_for_path(&root).await.unwrap();
    let src = store.node_for_path(&format!("{root}/src.txt")).unwrap();

    let mut batch = engine.new_batch();
    engine
        .stage_cp(&mut batch, src, store.device.uid, &format!("{root}/copy.txt"), false)
        .await
        .unwrap();
    let (completed, failed, pending) = engine.apply_batch(&batch).await.unwrap();
    assert_eq!((completed, failed, pending), (1, 0, 0));

    // File landed on disk with identical bytes.
    let copied = std::fs::read(tree.path().join("copy.txt")).unwrap();
    assert_eq!(copied, b"payload");

    // Index gained the destination with the same hash.
    let node = store
        .node_for_path(&format!("{root}/copy.txt"))
        .expect("copy indexed");
    assert_eq!(node.md5(), Some(md5_hex(b"payload").as_str()));

    engine.shutdown().await;
}

#[tokio::test]
async fn copy_onto_identical_destination_is_a_no_op() {
    let (_data, tree, engine, root) =
        scanned_engine(&[("a.txt", b"same".as_slice()), ("b.txt", b"same".as_slice())]).await;
    let store = engine.local_store_for_path(&root).await.unwrap();
    let src = store.node_for_path(&format!("{root}/a.txt")).unwrap();

    let before = std::fs::metadata(tree.path().join("b.txt")).unwrap().modified().unwrap();

    let mut batch = engine.new_batch();
    engine
        .stage_cp(&mut batch, src, store.device.uid, &format!("{root}/b.txt"), false)
        .await
        .unwrap();
    let (completed, failed, pending) = engine.apply_batch(&batch).await.unwrap();
    assert_eq!((completed, failed, pending), (1, 0, 0));

    // Destination was never rewritten.
    let after = std::fs::metadata(tree.path().join("b.txt")).unwrap().modified().unwrap();
    assert_eq!(before, after);

    engine.shutdown().await;
}

#[tokio::test]
async fn mkdir_then_copy_into_it() {
    let (_data, tree, engine, root) = scanned_engine(&[("src.txt", b"x".as_slice())]).await;
    let store = engine.local_store_for_path(&root).await.unwrap();
    let src = store.node_for_path(&format!("{root}/src.txt")).unwrap();

    let mut batch = engine.new_batch();
    // Copy staged before its parent mkdir; the graph reorders them.
    engine
        .stage_cp(
            &mut batch,
            src,
            store.device.uid,
            &format!("{root}/newdir/dst.txt"),
            false,
        )
        .await
        .unwrap();
    engine
        .stage_mkdir(&mut batch, store.device.uid, &format!("{root}/newdir"))
        .await
        .unwrap();

    let (completed, failed, pending) = engine.apply_batch(&batch).await.unwrap();
    assert_eq!((completed, failed, pending), (2, 0, 0));
    assert!(tree.path().join("newdir/dst.txt").exists());

    engine.shutdown().await;
}

#[tokio::test]
async fn directory_rm_batch_removes_contents_first() {
    let files: Vec<(String, Vec<u8>)> = (0..20)
        .map(|i| (format!("sub/f{i:02}.txt"), format!("content {i}").into_bytes()))
        .collect();
    let file_refs: Vec<(&str, &[u8])> = files
        .iter()
        .map(|(name, content)| (name.as_str(), content.as_slice()))
        .collect();
    let (_data, tree, engine, root) = scanned_engine(&file_refs).await;
    let store = engine.local_store_for_path(&root).await.unwrap();

    let mut batch = engine.new_batch();
    // Enqueue the directory RM in the middle of its children's RMs.
    let mut staged = 0;
    for (i, (name, _)) in files.iter().enumerate() {
        if i == 10 {
            let dir = store.node_for_path(&format!("{root}/sub")).unwrap();
            engine.stage_rm(&mut batch, dir);
            staged += 1;
        }
        let node = store.node_for_path(&format!("{root}/{name}")).unwrap();
        engine.stage_rm(&mut batch, node);
        staged += 1;
    }

    let (completed, failed, pending) = engine.apply_batch(&batch).await.unwrap();
    assert_eq!((completed, failed, pending), (staged, 0, 0));
    assert!(!tree.path().join("sub").exists());
    assert!(store.node_for_path(&format!("{root}/sub")).is_none());

    engine.shutdown().await;
}

#[tokio::test]
async fn copy_directory_batch_copies_recursively() {
    let (_data, tree, engine, root) = scanned_engine(&[
        ("sub/a.txt", b"alpha".as_slice()),
        ("sub/nested/b.txt", b"beta".as_slice()),
    ])
    .await;
    let store = engine.local_store_for_path(&root).await.unwrap();
    let src_dir = store.node_for_path(&format!("{root}/sub")).unwrap();
    assert!(src_dir.is_dir());

    let mut batch = engine.new_batch();
    engine
        .stage_cp(&mut batch, src_dir, store.device.uid, &format!("{root}/copy"), false)
        .await
        .unwrap();

    // START_DIR_CP + FINISH_DIR_CP per directory, one CP per file.
    assert_eq!(batch.ops.len(), 6);
    let total = batch.ops.len();
    let (completed, failed, pending) = engine.apply_batch(&batch).await.unwrap();
    assert_eq!((completed, failed, pending), (total, 0, 0));

    let a = std::fs::read(tree.path().join("copy/a.txt")).unwrap();
    assert_eq!(a, b"alpha");
    let b = std::fs::read(tree.path().join("copy/nested/b.txt")).unwrap();
    assert_eq!(b, b"beta");

    let copied = store
        .node_for_path(&format!("{root}/copy/nested/b.txt"))
        .expect("nested copy indexed");
    assert_eq!(copied.md5(), Some(md5_hex(b"beta").as_str()));

    engine.shutdown().await;
}

#[tokio::test]
async fn move_directory_batch_moves_and_removes_source() {
    let (_data, tree, engine, root) = scanned_engine(&[
        ("sub/one.txt", b"one".as_slice()),
        ("sub/two.txt", b"two".as_slice()),
    ])
    .await;
    let store = engine.local_store_for_path(&root).await.unwrap();
    let src_dir = store.node_for_path(&format!("{root}/sub")).unwrap();

    let mut batch = engine.new_batch();
    engine
        .stage_mv(&mut batch, src_dir, store.device.uid, &format!("{root}/moved"), false)
        .await
        .unwrap();

    // START_DIR_CP, two MVs, FINISH_DIR_CP, RM of the vacated source.
    assert_eq!(batch.ops.len(), 5);
    let total = batch.ops.len();
    let (completed, failed, pending) = engine.apply_batch(&batch).await.unwrap();
    assert_eq!((completed, failed, pending), (total, 0, 0));

    assert!(!tree.path().join("sub").exists());
    assert_eq!(
        std::fs::read(tree.path().join("moved/one.txt")).unwrap(),
        b"one"
    );
    assert_eq!(
        std::fs::read(tree.path().join("moved/two.txt")).unwrap(),
        b"two"
    );

    assert!(store.node_for_path(&format!("{root}/sub")).is_none());
    let moved = store
        .node_for_path(&format!("{root}/moved/one.txt"))
        .expect("moved file indexed");
    assert_eq!(moved.md5(), Some(md5_hex(b"one").as_str()));

    engine.shutdown().await;
}

#[tokio::test]
async fn move_batch_renames_and_reindexes() {
    let (_data, tree, engine, root) = scanned_engine(&[("old.txt", b"move me".as_slice())]).await;
    let store = engine.local_store_for_path(&root).await.unwrap();
    let src = store.node_for_path(&format!("{root}/old.txt")).unwrap();
    let src_uid = src.uid();

    let mut batch = engine.new_batch();
    engine
        .stage_mv(&mut batch, src, store.device.uid, &format!("{root}/new.txt"), false)
        .await
        .unwrap();
    let (completed, failed, pending) = engine.apply_batch(&batch).await.unwrap();
    assert_eq!((completed, failed, pending), (1, 0, 0));

    assert!(!tree.path().join("old.txt").exists());
    assert!(tree.path().join("new.txt").exists());
    assert!(store.node_for_path(&format!("{root}/old.txt")).is_none());
    let moved = store.node_for_path(&format!("{root}/new.txt")).unwrap();
    assert_ne!(moved.uid(), src_uid);
    assert_eq!(moved.md5(), Some(md5_hex(b"move me").as_str()));

    engine.shutdown().await;
}

#[tokio::test]
async fn failed_op_pauses_executor_and_blocks_dependents() {
    let (_data, tree, engine, root) = scanned_engine(&[("sub/f.txt", b"x".as_slice())]).await;
    let store = engine.local_store_for_path(&root).await.unwrap();

    let file_node = store.node_for_path(&format!("{root}/sub/f.txt")).unwrap();
    let dir_node = store.node_for_path(&format!("{root}/sub")).unwrap();

    // Make the child RM fail: replace the file with a non-empty directory so
    // remove_file errors.
    std::fs::remove_file(tree.path().join("sub/f.txt")).unwrap();
    std::fs::create_dir(tree.path().join("sub/f.txt")).unwrap();
    std::fs::write(tree.path().join("sub/f.txt/inner"), b"y").unwrap();

    let mut batch = engine.new_batch();
    engine.stage_rm(&mut batch, file_node);
    engine.stage_rm(&mut batch, dir_node);

    let (completed, failed, pending) = engine.apply_batch(&batch).await.unwrap();
    assert_eq!(completed, 0);
    assert_eq!(failed, 1);
    assert_eq!(pending, 1, "directory RM must stay blocked");

    let executor = engine.start_executor().await.unwrap();
    assert!(!executor.is_enabled(), "executor pauses after a failure");
    assert!(tree.path().join("sub").exists());

    engine.shutdown().await;
}
