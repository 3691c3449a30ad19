//! Cloud directory entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "cloud_dir")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub uid: i64,
    pub external_id: String,
    pub name: String,
    pub trashed: i32,
    pub create_ts: i64,
    pub modify_ts: i64,
    pub owner_uid: Option<i64>,
    pub drive_id: Option<String>,
    pub shared: bool,
    pub shared_by_uid: Option<i64>,
    pub sync_ts: i64,
    pub all_children_fetched: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
