//! Cloud file entity
//!
//! Parent links live in `id_parent_mapping`; this row carries the provider
//! metadata only.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "cloud_file")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub uid: i64,
    pub external_id: String,
    pub name: String,
    pub trashed: i32,
    pub size_bytes: i64,
    pub md5: Option<String>,
    pub create_ts: i64,
    pub modify_ts: i64,
    pub owner_uid: Option<i64>,
    pub drive_id: Option<String>,
    pub shared: bool,
    pub shared_by_uid: Option<i64>,
    pub version: Option<i64>,
    pub head_revision_id: Option<String>,
    pub sync_ts: i64,
    pub mime_type_uid: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
