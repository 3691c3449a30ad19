//! Initial migration for local disk cache databases

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LocalFile::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LocalFile::Uid)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(LocalFile::ParentUid).big_integer().not_null())
                    .col(ColumnDef::new(LocalFile::Md5).string())
                    .col(ColumnDef::new(LocalFile::Sha256).string())
                    .col(ColumnDef::new(LocalFile::SizeBytes).big_integer().not_null())
                    .col(ColumnDef::new(LocalFile::SyncTs).big_integer().not_null())
                    .col(ColumnDef::new(LocalFile::ModifyTs).big_integer().not_null())
                    .col(ColumnDef::new(LocalFile::ChangeTs).big_integer().not_null())
                    .col(ColumnDef::new(LocalFile::FullPath).string().not_null())
                    .col(ColumnDef::new(LocalFile::Trashed).integer().not_null().default(0))
                    .col(ColumnDef::new(LocalFile::Live).boolean().not_null().default(true))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_local_file_parent")
                    .table(LocalFile::Table)
                    .col(LocalFile::ParentUid)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_local_file_path")
                    .table(LocalFile::Table)
                    .col(LocalFile::FullPath)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_local_file_md5")
                    .table(LocalFile::Table)
                    .col(LocalFile::Md5)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(LocalDir::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LocalDir::Uid)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(LocalDir::ParentUid).big_integer().not_null())
                    .col(ColumnDef::new(LocalDir::FullPath).string().not_null())
                    .col(ColumnDef::new(LocalDir::Trashed).integer().not_null().default(0))
                    .col(ColumnDef::new(LocalDir::Live).boolean().not_null().default(true))
                    .col(
                        ColumnDef::new(LocalDir::AllChildrenFetched)
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
                    .name("idx_local_dir_parent")
                    .table(LocalDir::Table)
                    .col(LocalDir::ParentUid)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_local_dir_path")
                    .table(LocalDir::Table)
                    .col(LocalDir::FullPath)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LocalDir::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(LocalFile::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum LocalFile {
    Table,
    Uid,
    ParentUid,
    Md5,
    Sha256,
    SizeBytes,
    SyncTs,
    ModifyTs,
    ChangeTs,
    FullPath,
    Trashed,
    Live,
}

#[derive(DeriveIden)]
enum LocalDir {
    Table,
    Uid,
    ParentUid,
    FullPath,
    Trashed,
    Live,
    AllChildrenFetched,
}
