//! Local file entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "local_file")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub uid: i64,
    pub parent_uid: i64,
    pub md5: Option<String>,
    pub sha256: Option<String>,
    pub size_bytes: i64,
    pub sync_ts: i64,
    pub modify_ts: i64,
    pub change_ts: i64,
    pub full_path: String,
    pub trashed: i32,
    pub live: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
