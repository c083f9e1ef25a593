//! GrantRequest entity: rule mutations queued for the firewall agent

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum GrantAction {
    #[sea_orm(string_value = "add_rule")]
    AddRule,

    #[sea_orm(string_value = "remove_rule")]
    RemoveRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum GrantStatus {
    /// Waiting for the agent to pick it up
    #[sea_orm(string_value = "pending")]
    Pending,

    /// Rule applied and rule engine reloaded
    #[sea_orm(string_value = "completed")]
    Completed,

    #[sea_orm(string_value = "failed")]
    Failed,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "grant_requests")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub target: String,

    pub action: GrantAction,

    /// Rule label with the embedded expiry marker
    pub rule_label: String,

    pub status: GrantStatus,

    #[sea_orm(column_type = "Text", nullable)]
    pub error: Option<String>,

    pub created_at: ChronoDateTimeUtc,

    pub completed_at: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
