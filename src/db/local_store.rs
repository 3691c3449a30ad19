//! Local disk cache store
//!
//! Typed facade over a per-subtree local cache database. Scan writeback goes
//! through the batch operations; single-node mutations exist for executor
//! and live-monitor corrections.

use super::entities::{local_dir, local_file};
use super::migration::LocalIndexMigrator;
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
use tracing::{debug, warn};

pub struct LocalDiskStore {
    db: Arc<Database>,
    device_uid: DeviceUid,
}

impl LocalDiskStore {
    pub async fn open(path: &Path, device_uid: DeviceUid) -> EngineResult<Self> {
        let db = Database::open(path).await?;
        LocalIndexMigrator::up(db.conn(), None).await?;
        Ok(Self {
            db: Arc::new(db),
            device_uid,
        })
    }

    /// Load every cached node, registering each path with the uid registry so
    /// freshly issued uids cannot collide with persisted ones.
    pub async fn load_all(&self, registry: &UidRegistry) -> EngineResult<Vec<Node>> {
        let mut nodes = Vec::new();
        let mut max_uid: i64 = 0;

        for row in local_dir::Entity::find().all(self.db.conn()).await? {
            max_uid = max_uid.max(row.uid);
            let uid = registry.uid_for_path(&row.full_path, Some(Uid(row.uid)));
            if uid.0 != row.uid {
                warn!(
                    "Uid mapping conflict for cached dir '{}': registry={uid}, row={}",
                    row.full_path, row.uid
                );
            }
            nodes.push(self.dir_from_row(row));
        }

        for row in local_file::Entity::find().all(self.db.conn()).await? {
            max_uid = max_uid.max(row.uid);
            let uid = registry.uid_for_path(&row.full_path, Some(Uid(row.uid)));
            if uid.0 != row.uid {
                warn!(
                    "Uid mapping conflict for cached file '{}': registry={uid}, row={}",
                    row.full_path, row.uid
                );
            }
            nodes.push(self.file_from_row(row));
        }

        registry.ensure_next_greater_than(max_uid);
        debug!("Loaded {} local nodes from cache", nodes.len());
        Ok(nodes)
    }

    /// Batch upsert, splitting files from dirs. Much faster than single-node
    /// writes; the whole batch commits in one transaction.
    pub async fn upsert_node_list(&self, nodes: &[Node]) -> EngineResult<()> {
        let mut file_models = Vec::new();
        let mut dir_models = Vec::new();
        for node in nodes {
            if !node.is_live() {
                warn!("Persisting node with live=false; check caller: {node}");
            }
            match node {
                Node::File(f) => file_models.push(file_to_model(f)),
                Node::Dir(d) => dir_models.push(dir_to_model(d)),
            }
        }

        let _guard = self.db.write_guard().await;
        let txn = self.db.conn().begin().await?;

        if !dir_models.is_empty() {
            local_dir::Entity::insert_many(dir_models)
                .on_conflict(
                    OnConflict::column(local_dir::Column::Uid)
                        .update_columns([
                            local_dir::Column::ParentUid,
                            local_dir::Column::FullPath,
                            local_dir::Column::Trashed,
                            local_dir::Column::Live,
                            local_dir::Column::AllChildrenFetched,
                        ])
                        .to_owned(),
                )
                .exec(&txn)
                .await?;
        }

        if !file_models.is_empty() {
            local_file::Entity::insert_many(file_models)
                .on_conflict(
                    OnConflict::column(local_file::Column::Uid)
                        .update_columns([
                            local_file::Column::ParentUid,
                            local_file::Column::Md5,
                            local_file::Column::Sha256,
                            local_file::Column::SizeBytes,
                            local_file::Column::SyncTs,
                            local_file::Column::ModifyTs,
                            local_file::Column::ChangeTs,
                            local_file::Column::FullPath,
                            local_file::Column::Trashed,
                            local_file::Column::Live,
                        ])
                        .to_owned(),
                )
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;
        Ok(())
    }

    pub async fn upsert_node(&self, node: &Node) -> EngineResult<()> {
        self.upsert_node_list(std::slice::from_ref(node)).await
    }

    pub async fn delete_for_uid_list(&self, uid_list: &[Uid]) -> EngineResult<()> {
        if uid_list.is_empty() {
            return Ok(());
        }
        let raw: Vec<i64> = uid_list.iter().map(|u| u.0).collect();

        let _guard = self.db.write_guard().await;
        let txn = self.db.conn().begin().await?;
        local_file::Entity::delete_many()
            .filter(local_file::Column::Uid.is_in(raw.clone()))
            .exec(&txn)
            .await?;
        local_dir::Entity::delete_many()
            .filter(local_dir::Column::Uid.is_in(raw))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn get_for_uid(&self, uid: Uid) -> EngineResult<Option<Node>> {
        if let Some(row) = local_dir::Entity::find_by_id(uid.0).one(self.db.conn()).await? {
            return Ok(Some(self.dir_from_row(row)));
        }
        if let Some(row) = local_file::Entity::find_by_id(uid.0).one(self.db.conn()).await? {
            return Ok(Some(self.file_from_row(row)));
        }
        Ok(None)
    }

    pub async fn get_for_path(&self, full_path: &str) -> EngineResult<Option<Node>> {
        if let Some(row) = local_dir::Entity::find()
            .filter(local_dir::Column::FullPath.eq(full_path))
            .one(self.db.conn())
            .await?
        {
            return Ok(Some(self.dir_from_row(row)));
        }
        if let Some(row) = local_file::Entity::find()
            .filter(local_file::Column::FullPath.eq(full_path))
            .one(self.db.conn())
            .await?
        {
            return Ok(Some(self.file_from_row(row)));
        }
        Ok(None)
    }

    pub async fn children_of(&self, parent_uid: Uid) -> EngineResult<Vec<Node>> {
        let mut children = Vec::new();
        for row in local_dir::Entity::find()
            .filter(local_dir::Column::ParentUid.eq(parent_uid.0))
            .all(self.db.conn())
            .await?
        {
            children.push(self.dir_from_row(row));
        }
        for row in local_file::Entity::find()
            .filter(local_file::Column::ParentUid.eq(parent_uid.0))
            .all(self.db.conn())
            .await?
        {
            children.push(self.file_from_row(row));
        }
        Ok(children)
    }

    pub async fn nodes_with_md5(&self, md5: &str) -> EngineResult<Vec<Node>> {
        let rows = local_file::Entity::find()
            .filter(local_file::Column::Md5.eq(md5))
            .all(self.db.conn())
            .await?;
        Ok(rows.into_iter().map(|r| self.file_from_row(r)).collect())
    }

    pub async fn truncate(&self) -> EngineResult<()> {
        let _guard = self.db.write_guard().await;
        let txn = self.db.conn().begin().await?;
        local_file::Entity::delete_many().exec(&txn).await?;
        local_dir::Entity::delete_many().exec(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    fn file_from_row(&self, row: local_file::Model) -> Node {
        Node::File(FileNode {
            identifier: NodeIdentifier::new(self.device_uid, Uid(row.uid), row.full_path.clone()),
            parent_uids: vec![Uid(row.parent_uid)],
            size_bytes: row.size_bytes.max(0) as u64,
            md5: row.md5,
            sha256: row.sha256,
            sync_ts: row.sync_ts,
            modify_ts: row.modify_ts,
            change_ts: row.change_ts,
            trashed: TrashStatus::from(row.trashed),
            live: row.live,
            external_id: None,
            version: None,
        })
    }

    fn dir_from_row(&self, row: local_dir::Model) -> Node {
        Node::Dir(DirNode {
            identifier: NodeIdentifier::new(self.device_uid, Uid(row.uid), row.full_path.clone()),
            parent_uids: vec![Uid(row.parent_uid)],
            trashed: TrashStatus::from(row.trashed),
            live: row.live,
            all_children_fetched: row.all_children_fetched,
            sync_ts: 0,
            external_id: None,
        })
    }
}

fn file_to_model(node: &FileNode) -> local_file::ActiveModel {
    use sea_orm::ActiveValue::Set;
    local_file::ActiveModel {
        uid: Set(node.identifier.uid.0),
        parent_uid: Set(node.parent_uids.first().copied().unwrap_or(Uid::NULL).0),
        md5: Set(node.md5.clone()),
        sha256: Set(node.sha256.clone()),
        size_bytes: Set(node.size_bytes as i64),
        sync_ts: Set(node.sync_ts),
        modify_ts: Set(node.modify_ts),
        change_ts: Set(node.change_ts),
        full_path: Set(node.identifier.single_path().to_string()),
        trashed: Set(node.trashed.as_i32()),
        live: Set(node.live),
    }
}

fn dir_to_model(node: &DirNode) -> local_dir::ActiveModel {
    use sea_orm::ActiveValue::Set;
    local_dir::ActiveModel {
        uid: Set(node.identifier.uid.0),
        parent_uid: Set(node.parent_uids.first().copied().unwrap_or(Uid::NULL).0),
        full_path: Set(node.identifier.single_path().to_string()),
        trashed: Set(node.trashed.as_i32()),
        live: Set(node.live),
        all_children_fetched: Set(node.all_children_fetched),
    }
}
