//! Database migrations
//!
//! Versioned and forward-only. Each database flavor has its own migrator so
//! a cache database never grows tables belonging to another flavor.

use sea_orm_migration::prelude::*;

mod m20250601_000001_create_registry;
mod m20250602_000001_create_local_index;
mod m20250603_000001_create_cloud_index;

/// Migrator for the main registry database.
pub struct RegistryMigrator;

#[async_trait::async_trait]
impl MigratorTrait for RegistryMigrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20250601_000001_create_registry::Migration)]
    }
}

/// Migrator for per-tree local disk cache databases.
pub struct LocalIndexMigrator;

#[async_trait::async_trait]
impl MigratorTrait for LocalIndexMigrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20250602_000001_create_local_index::Migration)]
    }
}

/// Migrator for per-account cloud cache databases.
pub struct CloudIndexMigrator;

#[async_trait::async_trait]
impl MigratorTrait for CloudIndexMigrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20250603_000001_create_cloud_index::Migration)]
    }
}
