//! Resumable crawl progress
//!
//! One row per download type (initial load, change sync). The page token is
//! committed together with each fetched page so a crash restarts at the
//! last committed page.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "current_download")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub download_type: i32,
    pub state: i32,
    pub page_token: Option<String>,
    pub update_ts: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
