//! Cloud provider seam
//!
//! The OAuth/HTTP client is an external collaborator; the engine talks to it
//! only through `CloudClient`. Items arrive in provider shape (external ids,
//! parent id lists, opaque page and change tokens) and the scanner converts
//! them to nodes.

use crate::error::EngineResult;
use async_trait::async_trait;
use std::path::Path;

/// One item as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudItem {
    pub id: String,
    pub name: String,
    pub parent_ids: Vec<String>,
    pub is_dir: bool,
    pub trashed: bool,
    pub size_bytes: u64,
    pub md5: Option<String>,
    pub create_ts: i64,
    pub modify_ts: i64,
    pub version: Option<i64>,
}

/// One page of a paginated listing.
#[derive(Debug, Clone, Default)]
pub struct ItemPage {
    pub items: Vec<CloudItem>,
    pub next_page_token: Option<String>,
}

/// One entry of a change listing.
#[derive(Debug, Clone)]
pub enum ChangeRecord {
    Upserted(CloudItem),
    Removed { id: String },
}

/// One page of a change listing. When the provider reports the stream drained
/// it hands back a fresh start token instead of a next-page token.
#[derive(Debug, Clone, Default)]
pub struct ChangePage {
    pub changes: Vec<ChangeRecord>,
    pub next_page_token: Option<String>,
    pub new_start_token: Option<String>,
}

/// Contract the engine requires from the cloud provider client.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// The drive root folder. Not included in listings.
    async fn get_root(&self) -> EngineResult<CloudItem>;

    /// Paginated listing of every folder in the account.
    async fn list_folders(&self, page_token: Option<&str>) -> EngineResult<ItemPage>;

    /// Paginated listing of every non-folder in the account.
    async fn list_files(&self, page_token: Option<&str>) -> EngineResult<ItemPage>;

    /// Token demarcating "changes from now on".
    async fn get_changes_start_token(&self) -> EngineResult<String>;

    /// Changes since the given token.
    async fn list_changes(&self, page_token: &str) -> EngineResult<ChangePage>;

    /// Download file content to a local path (typically a staging location).
    async fn download_file(&self, id: &str, dst: &Path) -> EngineResult<()>;

    /// Upload a local file; returns the created item.
    async fn upload_file(&self, src: &Path, name: &str, parent_id: &str)
        -> EngineResult<CloudItem>;

    /// Create a folder; returns the created item.
    async fn create_folder(&self, name: &str, parent_id: &str) -> EngineResult<CloudItem>;

    /// Delete (or trash) an item.
    async fn delete_item(&self, id: &str, to_trash: bool) -> EngineResult<()>;

    /// Re-parent and/or rename an item.
    async fn move_item(
        &self,
        id: &str,
        old_parent_id: &str,
        new_parent_id: &str,
        new_name: &str,
    ) -> EngineResult<CloudItem>;

    /// Server-side copy of an item into a new parent.
    async fn copy_item(&self, id: &str, new_parent_id: &str, new_name: &str)
        -> EngineResult<CloudItem>;
}
