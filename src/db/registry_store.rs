//! Registry database store
//!
//! The main registry enumerates every cache database the engine has created:
//! one row per (device, subtree root), plus the device table that backs
//! DeviceUid allocation.

use super::entities::{cache_registry, device};
use super::migration::RegistryMigrator;
use super::Database;
use crate::device::{Device, DeviceUid, TreeType};
use crate::error::EngineResult;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter, TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// One row of the cache registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub device_uid: DeviceUid,
    pub cache_location: String,
    pub cache_type: TreeType,
    pub subtree_root_path: String,
    pub sync_ts: i64,
    pub is_complete: bool,
}

pub struct RegistryStore {
    db: Arc<Database>,
}

impl RegistryStore {
    pub async fn open(path: &Path) -> EngineResult<Self> {
        let db = Database::open(path).await?;
        RegistryMigrator::up(db.conn(), None).await?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Look up a device by (tree type, label), registering it if unknown.
    pub async fn get_or_create_device(
        &self,
        tree_type: TreeType,
        label: &str,
    ) -> EngineResult<Device> {
        if let Some(found) = device::Entity::find()
            .filter(device::Column::TreeType.eq(tree_type.as_i32()))
            .filter(device::Column::Label.eq(label))
            .one(self.db.conn())
            .await?
        {
            return Ok(Device::new(DeviceUid(found.uid), tree_type, label));
        }

        let _guard = self.db.write_guard().await;
        let inserted = device::ActiveModel {
            tree_type: Set(tree_type.as_i32()),
            label: Set(label.to_string()),
            ..Default::default()
        }
        .insert(self.db.conn())
        .await?;

        info!("Registered new {tree_type} device {} for '{label}'", inserted.uid);
        Ok(Device::new(DeviceUid(inserted.uid), tree_type, label))
    }

    pub async fn list_devices(&self) -> EngineResult<Vec<Device>> {
        let rows = device::Entity::find().all(self.db.conn()).await?;
        Ok(rows
            .into_iter()
            .map(|r| Device::new(DeviceUid(r.uid), TreeType::from(r.tree_type), r.label))
            .collect())
    }

    /// Record (or refresh) the cache database covering a subtree.
    pub async fn upsert_cache_entry(&self, entry: &CacheEntry) -> EngineResult<()> {
        let _guard = self.db.write_guard().await;
        let txn = self.db.conn().begin().await?;

        let existing = cache_registry::Entity::find()
            .filter(cache_registry::Column::DeviceUid.eq(entry.device_uid.0))
            .filter(cache_registry::Column::SubtreeRootPath.eq(entry.subtree_root_path.clone()))
            .one(&txn)
            .await?;

        match existing {
            Some(row) => {
                let mut model: cache_registry::ActiveModel = row.into();
                model.cache_location = Set(entry.cache_location.clone());
                model.sync_ts = Set(entry.sync_ts);
                model.is_complete = Set(entry.is_complete);
                model.update(&txn).await?;
            }
            None => {
                cache_registry::ActiveModel {
                    device_uid: Set(entry.device_uid.0),
                    cache_location: Set(entry.cache_location.clone()),
                    cache_type: Set(entry.cache_type.as_i32()),
                    subtree_root_path: Set(entry.subtree_root_path.clone()),
                    sync_ts: Set(entry.sync_ts),
                    is_complete: Set(entry.is_complete),
                    ..Default::default()
                }
                .insert(&txn)
                .await?;
            }
        }

        txn.commit().await?;
        Ok(())
    }

    pub async fn list_cache_entries(&self) -> EngineResult<Vec<CacheEntry>> {
        let rows = cache_registry::Entity::find().all(self.db.conn()).await?;
        Ok(rows
            .into_iter()
            .map(|r| CacheEntry {
                device_uid: DeviceUid(r.device_uid),
                cache_location: r.cache_location,
                cache_type: TreeType::from(r.cache_type),
                subtree_root_path: r.subtree_root_path,
                sync_ts: r.sync_ts,
                is_complete: r.is_complete,
            })
            .collect())
    }

    pub async fn find_cache_entry(
        &self,
        device_uid: DeviceUid,
        subtree_root_path: &str,
    ) -> EngineResult<Option<CacheEntry>> {
        let row = cache_registry::Entity::find()
            .filter(cache_registry::Column::DeviceUid.eq(device_uid.0))
            .filter(cache_registry::Column::SubtreeRootPath.eq(subtree_root_path))
            .one(self.db.conn())
            .await?;
        Ok(row.map(|r| CacheEntry {
            device_uid: DeviceUid(r.device_uid),
            cache_location: r.cache_location,
            cache_type: TreeType::from(r.cache_type),
            subtree_root_path: r.subtree_root_path,
            sync_ts: r.sync_ts,
            is_complete: r.is_complete,
        }))
    }
}
