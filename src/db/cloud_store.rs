//! Cloud cache store
//!
//! Typed facade over a per-account cloud cache database. Unlike the local
//! store, parent links live in a separate mapping table because the cloud
//! tree is a multi-parent DAG, and crawl progress is persisted per page in
//! `current_download`.

use super::entities::{cloud_dir, cloud_file, current_download, id_parent_mapping};
use super::migration::CloudIndexMigrator;
use super::Database;
use crate::device::{DeviceUid, Uid};
use crate::error::EngineResult;
use crate::node::{DirNode, FileNode, Node, NodeIdentifier, TrashStatus};
use crate::registry::UidRegistry;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, TransactionTrait};
use sea_orm_migration::MigratorTrait;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Which crawl a `current_download` row tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadType {
    InitialLoad = 1,
    Changes = 2,
}

impl DownloadType {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}

/// Crawl state machine position. Ordering matters: resuming compares states
/// with `<=` to decide which phases still need to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DownloadState {
    NotStarted = 0,
    GettingRoot = 1,
    GettingDirs = 2,
    GettingFiles = 3,
    ReadyToCompile = 4,
    Complete = 5,
}

impl From<i32> for DownloadState {
    fn from(value: i32) -> Self {
        match value {
            1 => DownloadState::GettingRoot,
            2 => DownloadState::GettingDirs,
            3 => DownloadState::GettingFiles,
            4 => DownloadState::ReadyToCompile,
            5 => DownloadState::Complete,
            _ => DownloadState::NotStarted,
        }
    }
}

/// Resumable crawl progress row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentDownload {
    pub download_type: DownloadType,
    pub state: DownloadState,
    pub page_token: Option<String>,
    pub update_ts: i64,
}

impl CurrentDownload {
    pub fn new(download_type: DownloadType, state: DownloadState, page_token: Option<String>, update_ts: i64) -> Self {
        Self {
            download_type,
            state,
            page_token,
            update_ts,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == DownloadState::Complete
    }
}

/// One child→parent link, keyed by the provider parent id until the compile
/// pass fills in `parent_uid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentMapping {
    pub child_uid: Uid,
    pub parent_uid: Option<Uid>,
    pub external_parent_id: String,
    pub sync_ts: i64,
}

pub struct CloudDiskStore {
    db: Arc<Database>,
    device_uid: DeviceUid,
}

impl CloudDiskStore {
    pub async fn open(path: &Path, device_uid: DeviceUid) -> EngineResult<Self> {
        let db = Database::open(path).await?;
        CloudIndexMigrator::up(db.conn(), None).await?;
        Ok(Self {
            db: Arc::new(db),
            device_uid,
        })
    }

    /// Load every cached cloud node. Paths are not stored for cloud nodes;
    /// the caller runs the compile pass to rebuild them from the mappings.
    pub async fn load_all(&self, registry: &UidRegistry) -> EngineResult<Vec<Node>> {
        let mut nodes = Vec::new();
        let mut max_uid: i64 = 0;

        for row in cloud_dir::Entity::find().all(self.db.conn()).await? {
            max_uid = max_uid.max(row.uid);
            registry.uid_for_external_id(&row.external_id, Some(Uid(row.uid)));
            nodes.push(self.dir_from_row(row));
        }
        for row in cloud_file::Entity::find().all(self.db.conn()).await? {
            max_uid = max_uid.max(row.uid);
            registry.uid_for_external_id(&row.external_id, Some(Uid(row.uid)));
            nodes.push(self.file_from_row(row));
        }

        registry.ensure_next_greater_than(max_uid);
        debug!("Loaded {} cloud nodes from cache", nodes.len());
        Ok(nodes)
    }

    pub async fn upsert_node_list(&self, nodes: &[Node]) -> EngineResult<()> {
        let mut file_models = Vec::new();
        let mut dir_models = Vec::new();
        for node in nodes {
            match node {
                Node::File(f) => file_models.push(file_to_model(f)),
                Node::Dir(d) => dir_models.push(dir_to_model(d)),
            }
        }

        let _guard = self.db.write_guard().await;
        let txn = self.db.conn().begin().await?;
        Self::upsert_models(&txn, file_models, dir_models).await?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn upsert_node(&self, node: &Node) -> EngineResult<()> {
        self.upsert_node_list(std::slice::from_ref(node)).await
    }

    /// Persist one fetched page atomically: its nodes, its parent mappings,
    /// and the advanced download cursor. This is the crash-resume boundary.
    pub async fn insert_page(
        &self,
        nodes: &[Node],
        mappings: &[ParentMapping],
        download: &CurrentDownload,
    ) -> EngineResult<()> {
        let mut file_models = Vec::new();
        let mut dir_models = Vec::new();
        for node in nodes {
            match node {
                Node::File(f) => file_models.push(file_to_model(f)),
                Node::Dir(d) => dir_models.push(dir_to_model(d)),
            }
        }
        let mapping_models: Vec<_> = mappings.iter().map(mapping_to_model).collect();

        let _guard = self.db.write_guard().await;
        let txn = self.db.conn().begin().await?;
        Self::upsert_models(&txn, file_models, dir_models).await?;
        if !mapping_models.is_empty() {
            id_parent_mapping::Entity::insert_many(mapping_models)
                .on_conflict(
                    OnConflict::columns([
                        id_parent_mapping::Column::ChildUid,
                        id_parent_mapping::Column::ExternalParentId,
                    ])
                    .update_columns([
                        id_parent_mapping::Column::ParentUid,
                        id_parent_mapping::Column::SyncTs,
                    ])
                    .to_owned(),
                )
                .exec(&txn)
                .await?;
        }
        Self::write_download(&txn, download).await?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn get_id_parent_mappings(&self) -> EngineResult<Vec<ParentMapping>> {
        let rows = id_parent_mapping::Entity::find().all(self.db.conn()).await?;
        Ok(rows
            .into_iter()
            .map(|r| ParentMapping {
                child_uid: Uid(r.child_uid),
                parent_uid: r.parent_uid.map(Uid),
                external_parent_id: r.external_parent_id,
                sync_ts: r.sync_ts,
            })
            .collect())
    }

    /// Replace all parent mappings with translated ones (parent uids filled).
    pub async fn replace_id_parent_mappings(
        &self,
        mappings: &[ParentMapping],
    ) -> EngineResult<()> {
        let models: Vec<_> = mappings.iter().map(mapping_to_model).collect();

        let _guard = self.db.write_guard().await;
        let txn = self.db.conn().begin().await?;
        id_parent_mapping::Entity::delete_many().exec(&txn).await?;
        if !models.is_empty() {
            id_parent_mapping::Entity::insert_many(models).exec(&txn).await?;
        }
        txn.commit().await?;
        Ok(())
    }


    pub async fn upsert_mappings_for_child(
        &self,
        child_uid: Uid,
        mappings: &[ParentMapping],
    ) -> EngineResult<()> {
        let models: Vec<_> = mappings.iter().map(mapping_to_model).collect();

        let _guard = self.db.write_guard().await;
        let txn = self.db.conn().begin().await?;
        id_parent_mapping::Entity::delete_many()
            .filter(id_parent_mapping::Column::ChildUid.eq(child_uid.0))
            .exec(&txn)
            .await?;
        if !models.is_empty() {
            id_parent_mapping::Entity::insert_many(models).exec(&txn).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Mark every cached directory fetched. Updating the whole table is much
    /// faster than a per-row where clause at the end of a full crawl.
    pub async fn mark_all_dirs_fetched(&self) -> EngineResult<()> {
        use sea_orm::ActiveValue::Set;
        let _guard = self.db.write_guard().await;
        cloud_dir::Entity::update_many()
            .set(cloud_dir::ActiveModel {
                all_children_fetched: Set(true),
                ..Default::default()
            })
            .exec(self.db.conn())
            .await?;
        Ok(())
    }

    pub async fn get_current_download(
        &self,
        download_type: DownloadType,
    ) -> EngineResult<Option<CurrentDownload>> {
        let row = current_download::Entity::find_by_id(download_type.as_i32())
            .one(self.db.conn())
            .await?;
        Ok(row.map(|r| CurrentDownload {
            download_type,
            state: DownloadState::from(r.state),
            page_token: r.page_token,
            update_ts: r.update_ts,
        }))
    }

    pub async fn create_or_update_download(&self, download: &CurrentDownload) -> EngineResult<()> {
        let _guard = self.db.write_guard().await;
        let txn = self.db.conn().begin().await?;
        Self::write_download(&txn, download).await?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn delete_for_uid_list(&self, uid_list: &[Uid]) -> EngineResult<()> {
        if uid_list.is_empty() {
            return Ok(());
        }
        let raw: Vec<i64> = uid_list.iter().map(|u| u.0).collect();

        let _guard = self.db.write_guard().await;
        let txn = self.db.conn().begin().await?;
        cloud_file::Entity::delete_many()
            .filter(cloud_file::Column::Uid.is_in(raw.clone()))
            .exec(&txn)
            .await?;
        cloud_dir::Entity::delete_many()
            .filter(cloud_dir::Column::Uid.is_in(raw.clone()))
            .exec(&txn)
            .await?;
        id_parent_mapping::Entity::delete_many()
            .filter(id_parent_mapping::Column::ChildUid.is_in(raw))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(())
    }

    /// Drop all cached tree data (not the download cursors).
    pub async fn truncate_tree(&self) -> EngineResult<()> {
        let _guard = self.db.write_guard().await;
        let txn = self.db.conn().begin().await?;
        cloud_file::Entity::delete_many().exec(&txn).await?;
        cloud_dir::Entity::delete_many().exec(&txn).await?;
        id_parent_mapping::Entity::delete_many().exec(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn get_for_external_id(&self, external_id: &str) -> EngineResult<Option<Node>> {
        if let Some(row) = cloud_dir::Entity::find()
            .filter(cloud_dir::Column::ExternalId.eq(external_id))
            .one(self.db.conn())
            .await?
        {
            return Ok(Some(self.dir_from_row(row)));
        }
        if let Some(row) = cloud_file::Entity::find()
            .filter(cloud_file::Column::ExternalId.eq(external_id))
            .one(self.db.conn())
            .await?
        {
            return Ok(Some(self.file_from_row(row)));
        }
        Ok(None)
    }

    async fn upsert_models(
        txn: &sea_orm::DatabaseTransaction,
        file_models: Vec<cloud_file::ActiveModel>,
        dir_models: Vec<cloud_dir::ActiveModel>,
    ) -> EngineResult<()> {
        if !dir_models.is_empty() {
            cloud_dir::Entity::insert_many(dir_models)
                .on_conflict(
                    OnConflict::column(cloud_dir::Column::Uid)
                        .update_columns([
                            cloud_dir::Column::ExternalId,
                            cloud_dir::Column::Name,
                            cloud_dir::Column::Trashed,
                            cloud_dir::Column::CreateTs,
                            cloud_dir::Column::ModifyTs,
                            cloud_dir::Column::OwnerUid,
                            cloud_dir::Column::DriveId,
                            cloud_dir::Column::Shared,
                            cloud_dir::Column::SharedByUid,
                            cloud_dir::Column::SyncTs,
                            cloud_dir::Column::AllChildrenFetched,
                        ])
                        .to_owned(),
                )
                .exec(txn)
                .await?;
        }
        if !file_models.is_empty() {
            cloud_file::Entity::insert_many(file_models)
                .on_conflict(
                    OnConflict::column(cloud_file::Column::Uid)
                        .update_columns([
                            cloud_file::Column::ExternalId,
                            cloud_file::Column::Name,
                            cloud_file::Column::Trashed,
                            cloud_file::Column::SizeBytes,
                            cloud_file::Column::Md5,
                            cloud_file::Column::CreateTs,
                            cloud_file::Column::ModifyTs,
                            cloud_file::Column::OwnerUid,
                            cloud_file::Column::DriveId,
                            cloud_file::Column::Shared,
                            cloud_file::Column::SharedByUid,
                            cloud_file::Column::Version,
                            cloud_file::Column::HeadRevisionId,
                            cloud_file::Column::SyncTs,
                            cloud_file::Column::MimeTypeUid,
                        ])
                        .to_owned(),
                )
                .exec(txn)
                .await?;
        }
        Ok(())
    }

    async fn write_download(
        txn: &sea_orm::DatabaseTransaction,
        download: &CurrentDownload,
    ) -> EngineResult<()> {
        use sea_orm::ActiveValue::Set;
        current_download::Entity::insert(current_download::ActiveModel {
            download_type: Set(download.download_type.as_i32()),
            state: Set(download.state as i32),
            page_token: Set(download.page_token.clone()),
            update_ts: Set(download.update_ts),
        })
        .on_conflict(
            OnConflict::column(current_download::Column::DownloadType)
                .update_columns([
                    current_download::Column::State,
                    current_download::Column::PageToken,
                    current_download::Column::UpdateTs,
                ])
                .to_owned(),
        )
        .exec(txn)
        .await?;
        Ok(())
    }

    // Rows carry a name but no full path; until the compile pass rebuilds
    // path lists from parent chains, the identifier holds "/<name>" so the
    // node's name stays derivable.
    fn file_from_row(&self, row: cloud_file::Model) -> Node {
        Node::File(FileNode {
            identifier: NodeIdentifier::new(self.device_uid, Uid(row.uid), format!("/{}", row.name)),
            parent_uids: Vec::new(),
            size_bytes: row.size_bytes.max(0) as u64,
            md5: row.md5,
            sha256: None,
            sync_ts: row.sync_ts,
            modify_ts: row.modify_ts,
            change_ts: row.create_ts,
            trashed: TrashStatus::from(row.trashed),
            live: true,
            external_id: Some(row.external_id),
            version: row.version,
        })
    }

    fn dir_from_row(&self, row: cloud_dir::Model) -> Node {
        Node::Dir(DirNode {
            identifier: NodeIdentifier::new(self.device_uid, Uid(row.uid), format!("/{}", row.name)),
            parent_uids: Vec::new(),
            trashed: TrashStatus::from(row.trashed),
            live: true,
            all_children_fetched: row.all_children_fetched,
            sync_ts: row.sync_ts,
            external_id: Some(row.external_id),
        })
    }
}

fn file_to_model(node: &FileNode) -> cloud_file::ActiveModel {
    use sea_orm::ActiveValue::Set;
    cloud_file::ActiveModel {
        uid: Set(node.identifier.uid.0),
        external_id: Set(node.external_id.clone().unwrap_or_default()),
        name: Set(node.identifier.name().to_string()),
        trashed: Set(node.trashed.as_i32()),
        size_bytes: Set(node.size_bytes as i64),
        md5: Set(node.md5.clone()),
        create_ts: Set(node.change_ts),
        modify_ts: Set(node.modify_ts),
        owner_uid: Set(None),
        drive_id: Set(None),
        shared: Set(false),
        shared_by_uid: Set(None),
        version: Set(node.version),
        head_revision_id: Set(None),
        sync_ts: Set(node.sync_ts),
        mime_type_uid: Set(None),
    }
}

fn dir_to_model(node: &DirNode) -> cloud_dir::ActiveModel {
    use sea_orm::ActiveValue::Set;
    cloud_dir::ActiveModel {
        uid: Set(node.identifier.uid.0),
        external_id: Set(node.external_id.clone().unwrap_or_default()),
        name: Set(node.identifier.name().to_string()),
        trashed: Set(node.trashed.as_i32()),
        create_ts: Set(0),
        modify_ts: Set(0),
        owner_uid: Set(None),
        drive_id: Set(None),
        shared: Set(false),
        shared_by_uid: Set(None),
        sync_ts: Set(node.sync_ts),
        all_children_fetched: Set(node.all_children_fetched),
    }
}

fn mapping_to_model(mapping: &ParentMapping) -> id_parent_mapping::ActiveModel {
    use sea_orm::ActiveValue::Set;
    id_parent_mapping::ActiveModel {
        child_uid: Set(mapping.child_uid.0),
        external_parent_id: Set(mapping.external_parent_id.clone()),
        parent_uid: Set(mapping.parent_uid.map(|u| u.0)),
        sync_ts: Set(mapping.sync_ts),
    }
}
