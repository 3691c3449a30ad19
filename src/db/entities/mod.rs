//! Database entities
//!
//! Registry database: `device`, `cache_registry`.
//! Local cache databases: `local_file`, `local_dir`.
//! Cloud cache databases: `cloud_file`, `cloud_dir`, `id_parent_mapping`,
//! `current_download`.

pub mod cache_registry;
pub mod cloud_dir;
pub mod cloud_file;
pub mod current_download;
pub mod device;
pub mod id_parent_mapping;
pub mod local_dir;
pub mod local_file;
