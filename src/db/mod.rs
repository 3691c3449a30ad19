//! Database infrastructure using SeaORM
//!
//! Three SQLite flavors share this wrapper: the main registry database, and
//! one cache database per (device, subtree root) in local and cloud shapes.
//! Reads go straight to the pooled connection; writes serialize under a
//! per-database mutex and run inside explicit transactions.

use sea_orm::{
    ConnectOptions, ConnectionTrait, Database as SeaDatabase, DatabaseConnection, DbErr, Statement,
};
use std::path::Path;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

pub mod cloud_store;
pub mod entities;
pub mod local_store;
pub mod migration;
pub mod registry_store;

const PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode=WAL",
    "PRAGMA synchronous=NORMAL",
    "PRAGMA temp_store=MEMORY",
    "PRAGMA cache_size=-20000",
];

/// SQLite-backed store shared by the registry and per-tree caches.
pub struct Database {
    conn: DatabaseConnection,
    write_lock: Mutex<()>,
}

impl Database {
    /// Open the database at the given path, creating it if missing.
    pub async fn open(path: &Path) -> Result<Self, DbErr> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DbErr::Custom(format!("Failed to create directory: {}", e)))?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", path.display());

        let mut opt = ConnectOptions::new(db_url);
        opt.max_connections(10)
            .min_connections(1)
            .connect_timeout(Duration::from_secs(8))
            .idle_timeout(Duration::from_secs(8))
            .sqlx_logging(false);

        let conn = SeaDatabase::connect(opt).await?;
        for pragma in PRAGMAS {
            let _ = conn
                .execute(Statement::from_string(
                    sea_orm::DatabaseBackend::Sqlite,
                    *pragma,
                ))
                .await;
        }

        info!("Opened database at {:?}", path);

        Ok(Self {
            conn,
            write_lock: Mutex::new(()),
        })
    }

    pub fn conn(&self) -> &DatabaseConnection {
        &self.conn
    }

    /// Serialize a write section. Hold the guard for the duration of the
    /// transaction; readers are unaffected.
    pub async fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }
}
