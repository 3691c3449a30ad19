//! Child-to-parent mapping for the cloud tree's multi-parent graph
//!
//! `parent_uid` is null until the compile pass translates the provider
//! parent id to an internal uid.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "id_parent_mapping")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub child_uid: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub external_parent_id: String,
    pub parent_uid: Option<i64>,
    pub sync_ts: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
