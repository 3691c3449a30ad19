//! Cloud tree loading and change-stream tests

mod helpers;

use helpers::{md5_hex, MockCloudClient};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;
use treesync::cloud::{ChangeRecord, CloudItem};
use treesync::Engine;

async fn engine() -> (TempDir, Arc<Engine>) {
    let data_dir = TempDir::new().unwrap();
    let engine = Engine::new(Some(data_dir.path().to_path_buf())).await.unwrap();
    (data_dir, engine)
}

fn populated_client(page_size: usize) -> Arc<MockCloudClient> {
    let client = Arc::new(MockCloudClient::new(page_size));
    let docs = client.add_folder("docs", client.root_id());
    let photos = client.add_folder("photos", client.root_id());
    client.add_file("readme.txt", &docs, b"hello cloud");
    client.add_file("a.jpg", &photos, b"jpegdata");
    client.add_file("b.jpg", &photos, b"jpegdata2");
    client
}

#[tokio::test]
async fn full_load_compiles_paths_from_parent_chains() {
    let (_data, engine) = engine().await;
    let client = populated_client(10);
    engine.set_cloud_client(client.clone()).await;

    let count = engine.load_cloud_tree("acct", false).await.unwrap();
    assert_eq!(count, 6); // root + 2 folders + 3 files

    let store = engine.add_cloud_tree("acct").await.unwrap();
    let node = store
        .memory
        .node_for_path("/My Drive/docs/readme.txt")
        .expect("file path compiled");
    assert_eq!(node.md5(), Some(md5_hex(b"hello cloud").as_str()));

    let docs = store.memory.node_for_path("/My Drive/docs").unwrap();
    assert!(docs.as_dir().unwrap().all_children_fetched);

    engine.shutdown().await;
}

#[tokio::test]
async fn interrupted_load_resumes_at_last_committed_page() {
    let (data_dir, engine) = engine().await;
    let client = Arc::new(MockCloudClient::new(1));
    let folder = client.add_folder("folder", client.root_id());
    for i in 0..6 {
        client.add_file(&format!("f{i}.bin"), &folder, format!("data{i}").as_bytes());
    }
    engine.set_cloud_client(client.clone()).await;

    // Outage mid-way through the file listing: the folder listing takes one
    // call, then every file page is one more call.
    client.fail_after_pages(4);
    assert!(engine.load_cloud_tree("acct", false).await.is_err());
    let pages_before_crash = client.pages_served();
    engine.shutdown().await;

    // Fresh process, same caches: the load resumes rather than restarting.
    let engine = Engine::new(Some(data_dir.path().to_path_buf())).await.unwrap();
    client.heal();
    engine.set_cloud_client(client.clone()).await;
    let count = engine.load_cloud_tree("acct", false).await.unwrap();
    assert_eq!(count, 8); // root + folder + 6 files

    let resumed_pages = client.pages_served() - pages_before_crash;
    let full_pages = pages_before_crash + resumed_pages;
    assert!(
        resumed_pages < full_pages,
        "resume must not refetch every page (refetched {resumed_pages} of {full_pages})"
    );

    // No duplicate rows: every file appears exactly once.
    let store = engine.add_cloud_tree("acct").await.unwrap();
    for i in 0..6 {
        let nodes = store
            .memory
            .nodes_for_path(&format!("/My Drive/folder/f{i}.bin"));
        assert_eq!(nodes.len(), 1, "f{i}.bin duplicated");
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn multi_parent_file_gets_a_path_per_chain() {
    let (_data, engine) = engine().await;
    let client = Arc::new(MockCloudClient::new(10));
    let a = client.add_folder("a", client.root_id());
    let b = client.add_folder("b", client.root_id());
    let shared = client.add_file("shared.txt", &a, b"shared");
    engine.set_cloud_client(client.clone()).await;
    engine.load_cloud_tree("acct", false).await.unwrap();

    // Second parent link, the provider's "add to folder" feature.
    {
        let mut item = client.item(&shared).unwrap();
        item.parent_ids.push(b.clone());
        client.push_change(ChangeRecord::Upserted(item));
    }

    let store = engine.add_cloud_tree("acct").await.unwrap();
    let loader_applied = {
        // Apply the queued change through the poll path.
        let loader = treesync::scan::CloudTreeLoader::new(
            store.clone(),
            client.clone(),
            engine.events.clone(),
            engine.task_runner(),
        );
        loader.apply_changes().await.unwrap()
    };
    assert_eq!(loader_applied, 1);

    let node = store
        .memory
        .node_for_path("/My Drive/a/shared.txt")
        .expect("first chain");
    assert!(node.path_list().contains(&"/My Drive/b/shared.txt".to_string()));

    engine.shutdown().await;
}

#[tokio::test]
async fn change_stream_applies_upserts_and_removals() {
    let (_data, engine) = engine().await;
    let client = populated_client(10);
    engine.set_cloud_client(client.clone()).await;
    engine.load_cloud_tree("acct", false).await.unwrap();

    let store = engine.add_cloud_tree("acct").await.unwrap();
    let removed = store
        .memory
        .node_for_path("/My Drive/photos/a.jpg")
        .unwrap();

    let docs_id = store
        .memory
        .node_for_path("/My Drive/docs")
        .unwrap()
        .external_id()
        .unwrap()
        .to_string();
    client.push_change(ChangeRecord::Upserted(CloudItem {
        id: "item-new".to_string(),
        name: "appeared.txt".to_string(),
        parent_ids: vec![docs_id],
        is_dir: false,
        trashed: false,
        size_bytes: 3,
        md5: Some(md5_hex(b"new")),
        create_ts: 2,
        modify_ts: 2,
        version: Some(1),
    }));
    client.push_change(ChangeRecord::Removed {
        id: removed.external_id().unwrap().to_string(),
    });

    let loader = treesync::scan::CloudTreeLoader::new(
        store.clone(),
        client.clone(),
        engine.events.clone(),
        engine.task_runner(),
    );
    let applied = loader.apply_changes().await.unwrap();
    assert_eq!(applied, 2);

    assert!(store
        .memory
        .node_for_path("/My Drive/docs/appeared.txt")
        .is_some());
    assert!(store
        .memory
        .node_for_path("/My Drive/photos/a.jpg")
        .is_none());

    // A second poll with no new changes applies nothing.
    assert_eq!(loader.apply_changes().await.unwrap(), 0);

    engine.shutdown().await;
}
