//! Initial migration for cloud cache databases

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CloudFile::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CloudFile::Uid)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CloudFile::ExternalId).string().not_null())
                    .col(ColumnDef::new(CloudFile::Name).string().not_null())
                    .col(ColumnDef::new(CloudFile::Trashed).integer().not_null().default(0))
                    .col(ColumnDef::new(CloudFile::SizeBytes).big_integer().not_null())
                    .col(ColumnDef::new(CloudFile::Md5).string())
                    .col(ColumnDef::new(CloudFile::CreateTs).big_integer().not_null())
                    .col(ColumnDef::new(CloudFile::ModifyTs).big_integer().not_null())
                    .col(ColumnDef::new(CloudFile::OwnerUid).big_integer())
                    .col(ColumnDef::new(CloudFile::DriveId).string())
                    .col(ColumnDef::new(CloudFile::Shared).boolean().not_null().default(false))
                    .col(ColumnDef::new(CloudFile::SharedByUid).big_integer())
                    .col(ColumnDef::new(CloudFile::Version).big_integer())
                    .col(ColumnDef::new(CloudFile::HeadRevisionId).string())
                    .col(ColumnDef::new(CloudFile::SyncTs).big_integer().not_null())
                    .col(ColumnDef::new(CloudFile::MimeTypeUid).big_integer())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_cloud_file_external_id")
                    .table(CloudFile::Table)
                    .col(CloudFile::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_cloud_file_md5")
                    .table(CloudFile::Table)
                    .col(CloudFile::Md5)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(CloudDir::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CloudDir::Uid)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CloudDir::ExternalId).string().not_null())
                    .col(ColumnDef::new(CloudDir::Name).string().not_null())
                    .col(ColumnDef::new(CloudDir::Trashed).integer().not_null().default(0))
                    .col(ColumnDef::new(CloudDir::CreateTs).big_integer().not_null())
                    .col(ColumnDef::new(CloudDir::ModifyTs).big_integer().not_null())
                    .col(ColumnDef::new(CloudDir::OwnerUid).big_integer())
                    .col(ColumnDef::new(CloudDir::DriveId).string())
                    .col(ColumnDef::new(CloudDir::Shared).boolean().not_null().default(false))
                    .col(ColumnDef::new(CloudDir::SharedByUid).big_integer())
                    .col(ColumnDef::new(CloudDir::SyncTs).big_integer().not_null())
                    .col(
                        ColumnDef::new(CloudDir::AllChildrenFetched)
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
                    .name("idx_cloud_dir_external_id")
                    .table(CloudDir::Table)
                    .col(CloudDir::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(IdParentMapping::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(IdParentMapping::ChildUid).big_integer().not_null())
                    .col(
                        ColumnDef::new(IdParentMapping::ExternalParentId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(IdParentMapping::ParentUid).big_integer())
                    .col(ColumnDef::new(IdParentMapping::SyncTs).big_integer().not_null())
                    .primary_key(
                        Index::create()
                            .col(IdParentMapping::ChildUid)
                            .col(IdParentMapping::ExternalParentId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_id_parent_mapping_parent")
                    .table(IdParentMapping::Table)
                    .col(IdParentMapping::ParentUid)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(CurrentDownload::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CurrentDownload::DownloadType)
                            .integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CurrentDownload::State).integer().not_null())
                    .col(ColumnDef::new(CurrentDownload::PageToken).string())
                    .col(ColumnDef::new(CurrentDownload::UpdateTs).big_integer().not_null())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CurrentDownload::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(IdParentMapping::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(CloudDir::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(CloudFile::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CloudFile {
    Table,
    Uid,
    ExternalId,
    Name,
    Trashed,
    SizeBytes,
    Md5,
    CreateTs,
    ModifyTs,
    OwnerUid,
    DriveId,
    Shared,
    SharedByUid,
    Version,
    HeadRevisionId,
    SyncTs,
    MimeTypeUid,
}

#[derive(DeriveIden)]
enum CloudDir {
    Table,
    Uid,
    ExternalId,
    Name,
    Trashed,
    CreateTs,
    ModifyTs,
    OwnerUid,
    DriveId,
    Shared,
    SharedByUid,
    SyncTs,
    AllChildrenFetched,
}

#[derive(DeriveIden)]
enum IdParentMapping {
    Table,
    ChildUid,
    ExternalParentId,
    ParentUid,
    SyncTs,
}

#[derive(DeriveIden)]
enum CurrentDownload {
    Table,
    DownloadType,
    State,
    PageToken,
    UpdateTs,
}
