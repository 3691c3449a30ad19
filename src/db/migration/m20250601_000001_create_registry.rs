//! Initial migration for the registry database

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Device::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Device::Uid)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Device::TreeType).integer().not_null())
                    .col(ColumnDef::new(Device::Label).string().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_device_label")
                    .table(Device::Table)
                    .col(Device::TreeType)
                    .col(Device::Label)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(CacheRegistry::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CacheRegistry::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CacheRegistry::DeviceUid).big_integer().not_null())
                    .col(ColumnDef::new(CacheRegistry::CacheLocation).string().not_null())
                    .col(ColumnDef::new(CacheRegistry::CacheType).integer().not_null())
                    .col(
                        ColumnDef::new(CacheRegistry::SubtreeRootPath)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(CacheRegistry::SyncTs).big_integer().not_null())
                    .col(
                        ColumnDef::new(CacheRegistry::IsComplete)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_cache_registry_device_root")
                    .table(CacheRegistry::Table)
                    .col(CacheRegistry::DeviceUid)
                    .col(CacheRegistry::SubtreeRootPath)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CacheRegistry::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Device::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Device {
    Table,
    Uid,
    TreeType,
    Label,
}

#[derive(DeriveIden)]
enum CacheRegistry {
    Table,
    Id,
    DeviceUid,
    CacheLocation,
    CacheType,
    SubtreeRootPath,
    SyncTs,
    IsComplete,
}
