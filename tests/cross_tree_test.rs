//! Cross-tree transfer tests: local ↔ cloud copies with hash verification

mod helpers;

use helpers::{md5_hex, MockCloudClient};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;
use treesync::events::Event;
use treesync::Engine;

struct Rig {
    _data_dir: TempDir,
    tree_dir: TempDir,
    engine: Arc<Engine>,
    client: Arc<MockCloudClient>,
    root: String,
}

async fn rig(files: &[(&str, &[u8])]) -> Rig {
    let data_dir = TempDir::new().unwrap();
    let tree_dir = TempDir::new().unwrap();
    for (rel, content) in files {
        let path = tree_dir.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
    }
    let root = tree_dir.path().to_string_lossy().to_string();

    let engine = Engine::new(Some(data_dir.path().to_path_buf())).await.unwrap();
    let client = Arc::new(MockCloudClient::new(10));
    client.add_folder("inbox", client.root_id());
    engine.set_cloud_client(client.clone()).await;

    engine.scan_local(&root).await.unwrap();
    engine.load_cloud_tree("acct", false).await.unwrap();

    Rig {
        _data_dir: data_dir,
        tree_dir,
        engine,
        client,
        root,
    }
}

#[tokio::test]
async fn copy_local_to_cloud_verifies_and_indexes() {
    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let rig = rig(&[("big.bin", payload.as_slice())]).await;
    let engine = &rig.engine;

    let local = engine.local_store_for_path(&rig.root).await.unwrap();
    let cloud = engine.add_cloud_tree("acct").await.unwrap();
    let src = local.node_for_path(&format!("{}/big.bin", rig.root)).unwrap();
    let expected_md5 = md5_hex(&payload);

    let mut events = engine.events.subscribe();

    let mut batch = engine.new_batch();
    engine
        .stage_cp(
            &mut batch,
            src,
            cloud.device.uid,
            "/My Drive/inbox/big.bin",
            false,
        )
        .await
        .unwrap();
    let (completed, failed, pending) = engine.apply_batch(&batch).await.unwrap();
    assert_eq!((completed, failed, pending), (1, 0, 0));

    // The memory index gained a cloud node with the source's hash.
    let node = cloud
        .memory
        .node_for_path("/My Drive/inbox/big.bin")
        .expect("uploaded file indexed");
    assert_eq!(node.md5(), Some(expected_md5.as_str()));
    let external_id = node.external_id().unwrap().to_string();

    // The persistent index committed the same node.
    let persisted = cloud
        .disk
        .get_for_external_id(&external_id)
        .await
        .unwrap()
        .expect("uploaded file persisted");
    assert_eq!(persisted.md5(), Some(expected_md5.as_str()));

    // A destination-side upsert signal fired.
    let mut saw_upsert = false;
    while let Ok(event) = events.try_recv() {
        if let Event::NodeUpserted { node } = event {
            if node.external_id() == Some(external_id.as_str()) {
                saw_upsert = true;
            }
        }
    }
    assert!(saw_upsert, "NodeUpserted must fire for the new cloud node");

    engine.shutdown().await;
}

#[tokio::test]
async fn copy_cloud_to_local_stages_and_verifies() {
    let rig = rig(&[("seed.txt", b"seed".as_slice())]).await;
    let engine = &rig.engine;

    let inbox_id = {
        let cloud = engine.add_cloud_tree("acct").await.unwrap();
        cloud
            .memory
            .node_for_path("/My Drive/inbox")
            .unwrap()
            .external_id()
            .unwrap()
            .to_string()
    };
    rig.client.add_file("down.bin", &inbox_id, b"downloaded bytes");
    // Make the new file visible to the index.
    engine.load_cloud_tree("acct", true).await.unwrap();

    let cloud = engine.add_cloud_tree("acct").await.unwrap();
    let local = engine.local_store_for_path(&rig.root).await.unwrap();
    let src = cloud
        .memory
        .node_for_path("/My Drive/inbox/down.bin")
        .expect("cloud file indexed");

    let mut batch = engine.new_batch();
    engine
        .stage_cp(
            &mut batch,
            src,
            local.device.uid,
            &format!("{}/down.bin", rig.root),
            false,
        )
        .await
        .unwrap();
    let (completed, failed, pending) = engine.apply_batch(&batch).await.unwrap();
    assert_eq!((completed, failed, pending), (1, 0, 0));

    let on_disk = std::fs::read(rig.tree_dir.path().join("down.bin")).unwrap();
    assert_eq!(on_disk, b"downloaded bytes");

    let node = local
        .node_for_path(&format!("{}/down.bin", rig.root))
        .expect("downloaded file indexed");
    assert_eq!(node.md5(), Some(md5_hex(b"downloaded bytes").as_str()));

    engine.shutdown().await;
}

#[tokio::test]
async fn move_local_to_cloud_deletes_source_after_upload() {
    let rig = rig(&[("mover.txt", b"migrate me".as_slice())]).await;
    let engine = &rig.engine;

    let local = engine.local_store_for_path(&rig.root).await.unwrap();
    let cloud = engine.add_cloud_tree("acct").await.unwrap();
    let src = local
        .node_for_path(&format!("{}/mover.txt", rig.root))
        .unwrap();

    let mut batch = engine.new_batch();
    engine
        .stage_mv(
            &mut batch,
            src,
            cloud.device.uid,
            "/My Drive/inbox/mover.txt",
            false,
        )
        .await
        .unwrap();
    let (completed, failed, pending) = engine.apply_batch(&batch).await.unwrap();
    assert_eq!((completed, failed, pending), (1, 0, 0));

    assert!(!rig.tree_dir.path().join("mover.txt").exists());
    assert!(local
        .node_for_path(&format!("{}/mover.txt", rig.root))
        .is_none());
    assert!(cloud
        .memory
        .node_for_path("/My Drive/inbox/mover.txt")
        .is_some());

    engine.shutdown().await;
}

#[tokio::test]
async fn upload_onto_identical_cloud_content_is_a_no_op() {
    let rig = rig(&[("dup.txt", b"duplicate".as_slice())]).await;
    let engine = &rig.engine;

    let inbox_id = {
        let cloud = engine.add_cloud_tree("acct").await.unwrap();
        cloud
            .memory
            .node_for_path("/My Drive/inbox")
            .unwrap()
            .external_id()
            .unwrap()
            .to_string()
    };
    rig.client.add_file("dup.txt", &inbox_id, b"duplicate");
    engine.load_cloud_tree("acct", true).await.unwrap();

    let local = engine.local_store_for_path(&rig.root).await.unwrap();
    let cloud = engine.add_cloud_tree("acct").await.unwrap();
    let src = local.node_for_path(&format!("{}/dup.txt", rig.root)).unwrap();
    let items_before = rig.client.item_count();

    let mut batch = engine.new_batch();
    engine
        .stage_cp(
            &mut batch,
            src,
            cloud.device.uid,
            "/My Drive/inbox/dup.txt",
            false,
        )
        .await
        .unwrap();
    let (completed, failed, pending) = engine.apply_batch(&batch).await.unwrap();
    assert_eq!((completed, failed, pending), (1, 0, 0));

    // Nothing was uploaded.
    assert_eq!(rig.client.item_count(), items_before);

    engine.shutdown().await;
}
