//! Cache registry entity (registry database)
//!
//! One row per cache database: which device and subtree it covers, where it
//! lives on disk, and whether its last scan ran to completion.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "cache_registry")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub device_uid: i64,
    pub cache_location: String,
    pub cache_type: i32,
    pub subtree_root_path: String,
    pub sync_ts: i64,
    pub is_complete: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
