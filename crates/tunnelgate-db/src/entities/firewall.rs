//! Firewall entity
//!
//! Rows are owned by the inventory subsystem; the tunnel manager only reads them.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "firewalls")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Hostname or IP address reachable over SSH
    pub hostname: String,

    pub ssh_port: i32,

    pub ssh_user: String,

    /// Port of the web UI as seen from the firewall itself
    pub web_port: i32,

    /// Private key used to authenticate; falls back to the global key when unset
    #[sea_orm(nullable)]
    pub identity_file: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
