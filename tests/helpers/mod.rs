//! Shared test helpers: an in-memory cloud provider and tree builders.

#![allow(dead_code)]

use async_trait::async_trait;
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use treesync::cloud::{ChangePage, ChangeRecord, CloudClient, CloudItem, ItemPage};
use treesync::error::{EngineError, EngineResult};

pub fn md5_hex(content: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

#[derive(Default)]
struct MockDrive {
    items: BTreeMap<String, CloudItem>,
    contents: HashMap<String, Vec<u8>>,
    changes: Vec<ChangeRecord>,
    next_id: u64,
}

impl MockDrive {
    fn alloc_id(&mut self) -> String {
        self.next_id += 1;
        format!("item-{:04}", self.next_id)
    }
}

/// In-memory stand-in for the cloud provider. Listings paginate with a
/// configurable page size; an outage can be injected after a number of
/// served pages to exercise crash-resume.
pub struct MockCloudClient {
    drive: Mutex<MockDrive>,
    page_size: usize,
    pages_served: AtomicUsize,
    fail_after_pages: Mutex<Option<usize>>,
    root_id: String,
}

impl MockCloudClient {
    pub fn new(page_size: usize) -> Self {
        let mut drive = MockDrive::default();
        let root_id = "root".to_string();
        drive.items.insert(
            root_id.clone(),
            CloudItem {
                id: root_id.clone(),
                name: "My Drive".to_string(),
                parent_ids: Vec::new(),
                is_dir: true,
                trashed: false,
                size_bytes: 0,
                md5: None,
                create_ts: 1,
                modify_ts: 1,
                version: Some(1),
            },
        );
        Self {
            drive: Mutex::new(drive),
            page_size: page_size.max(1),
            pages_served: AtomicUsize::new(0),
            fail_after_pages: Mutex::new(None),
            root_id,
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Serve `pages` more pages, then fail every listing call.
    pub fn fail_after_pages(&self, pages: usize) {
        *self.fail_after_pages.lock().unwrap() = Some(pages);
    }

    pub fn heal(&self) {
        *self.fail_after_pages.lock().unwrap() = None;
    }

    pub fn pages_served(&self) -> usize {
        self.pages_served.load(Ordering::SeqCst)
    }

    pub fn add_folder(&self, name: &str, parent_id: &str) -> String {
        let mut drive = self.drive.lock().unwrap();
        let id = drive.alloc_id();
        drive.items.insert(
            id.clone(),
            CloudItem {
                id: id.clone(),
                name: name.to_string(),
                parent_ids: vec![parent_id.to_string()],
                is_dir: true,
                trashed: false,
                size_bytes: 0,
                md5: None,
                create_ts: 1,
                modify_ts: 1,
                version: Some(1),
            },
        );
        id
    }

    pub fn add_file(&self, name: &str, parent_id: &str, content: &[u8]) -> String {
        let mut drive = self.drive.lock().unwrap();
        let id = drive.alloc_id();
        drive.items.insert(
            id.clone(),
            CloudItem {
                id: id.clone(),
                name: name.to_string(),
                parent_ids: vec![parent_id.to_string()],
                is_dir: false,
                trashed: false,
                size_bytes: content.len() as u64,
                md5: Some(md5_hex(content)),
                create_ts: 1,
                modify_ts: 1,
                version: Some(1),
            },
        );
        drive.contents.insert(id.clone(), content.to_vec());
        id
    }

    /// Record an external change for the change stream.
    pub fn push_change(&self, change: ChangeRecord) {
        self.drive.lock().unwrap().changes.push(change);
    }

    pub fn item(&self, id: &str) -> Option<CloudItem> {
        self.drive.lock().unwrap().items.get(id).cloned()
    }

    pub fn item_count(&self) -> usize {
        self.drive.lock().unwrap().items.len()
    }

    fn check_outage(&self) -> EngineResult<()> {
        let mut fail_after = self.fail_after_pages.lock().unwrap();
        if let Some(remaining) = fail_after.as_mut() {
            if *remaining == 0 {
                return Err(EngineError::cloud("simulated outage"));
            }
            *remaining -= 1;
        }
        Ok(())
    }

    fn list_page(&self, dirs: bool, page_token: Option<&str>) -> EngineResult<ItemPage> {
        self.check_outage()?;
        self.pages_served.fetch_add(1, Ordering::SeqCst);

        let drive = self.drive.lock().unwrap();
        let all: Vec<CloudItem> = drive
            .items
            .values()
            .filter(|item| item.is_dir == dirs && item.id != self.root_id)
            .cloned()
            .collect();

        let offset: usize = page_token.map(|t| t.parse().unwrap_or(0)).unwrap_or(0);
        let end = (offset + self.page_size).min(all.len());
        let items = all[offset.min(all.len())..end].to_vec();
        let next_page_token = (end < all.len()).then(|| end.to_string());
        Ok(ItemPage {
            items,
            next_page_token,
        })
    }
}

#[async_trait]
impl CloudClient for MockCloudClient {
    async fn get_root(&self) -> EngineResult<CloudItem> {
        Ok(self.item(&self.root_id).expect("root exists"))
    }

    async fn list_folders(&self, page_token: Option<&str>) -> EngineResult<ItemPage> {
        self.list_page(true, page_token)
    }

    async fn list_files(&self, page_token: Option<&str>) -> EngineResult<ItemPage> {
        self.list_page(false, page_token)
    }

    async fn get_changes_start_token(&self) -> EngineResult<String> {
        Ok(self.drive.lock().unwrap().changes.len().to_string())
    }

    async fn list_changes(&self, page_token: &str) -> EngineResult<ChangePage> {
        let drive = self.drive.lock().unwrap();
        let offset: usize = page_token.parse().unwrap_or(0);
        let changes = drive.changes[offset.min(drive.changes.len())..].to_vec();
        Ok(ChangePage {
            changes,
            next_page_token: None,
            new_start_token: Some(drive.changes.len().to_string()),
        })
    }

    async fn download_file(&self, id: &str, dst: &Path) -> EngineResult<()> {
        let content = self
            .drive
            .lock()
            .unwrap()
            .contents
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::cloud(format!("no such item: {id}")))?;
        std::fs::write(dst, content)?;
        Ok(())
    }

    async fn upload_file(
        &self,
        src: &Path,
        name: &str,
        parent_id: &str,
    ) -> EngineResult<CloudItem> {
        let content = std::fs::read(src)?;
        let id = self.add_file(name, parent_id, &content);
        Ok(self.item(&id).expect("uploaded item exists"))
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> EngineResult<CloudItem> {
        let id = self.add_folder(name, parent_id);
        Ok(self.item(&id).expect("created folder exists"))
    }

    async fn delete_item(&self, id: &str, to_trash: bool) -> EngineResult<()> {
        let mut drive = self.drive.lock().unwrap();
        if to_trash {
            if let Some(item) = drive.items.get_mut(id) {
                item.trashed = true;
                return Ok(());
            }
        } else if drive.items.remove(id).is_some() {
            drive.contents.remove(id);
            return Ok(());
        }
        Err(EngineError::cloud(format!("no such item: {id}")))
    }

    async fn move_item(
        &self,
        id: &str,
        old_parent_id: &str,
        new_parent_id: &str,
        new_name: &str,
    ) -> EngineResult<CloudItem> {
        let mut drive = self.drive.lock().unwrap();
        let item = drive
            .items
            .get_mut(id)
            .ok_or_else(|| EngineError::cloud(format!("no such item: {id}")))?;
        item.parent_ids.retain(|p| p != old_parent_id);
        item.parent_ids.push(new_parent_id.to_string());
        item.name = new_name.to_string();
        item.version = item.version.map(|v| v + 1);
        Ok(item.clone())
    }

    async fn copy_item(
        &self,
        id: &str,
        new_parent_id: &str,
        new_name: &str,
    ) -> EngineResult<CloudItem> {
        let (content, md5) = {
            let drive = self.drive.lock().unwrap();
            let item = drive
                .items
                .get(id)
                .ok_or_else(|| EngineError::cloud(format!("no such item: {id}")))?;
            (drive.contents.get(id).cloned().unwrap_or_default(), item.md5.clone())
        };
        let new_id = self.add_file(new_name, new_parent_id, &content);
        let mut item = self.item(&new_id).expect("copied item exists");
        item.md5 = md5;
        Ok(item)
    }
}
