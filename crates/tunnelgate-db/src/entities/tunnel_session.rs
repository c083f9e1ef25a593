//! TunnelSession entity: one row per granted remote-access window

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[sea_orm(string_value = "active")]
    Active,

    #[sea_orm(string_value = "closed")]
    Closed,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnel_sessions")]
pub struct Model {
    /// Store-assigned session ID (UUID v4)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Firewall identifier the tunnel points at
    pub target: String,

    /// Address of the requester
    pub source_ip: String,

    /// Loopback port the tunnel process listens on
    pub tunnel_port: i32,

    /// Public route (path or paired port) once the proxy fragment is live
    #[sea_orm(nullable)]
    pub proxy_route: Option<String>,

    /// Label of the per-session firewall rule (legacy grant strategy only)
    #[sea_orm(nullable)]
    pub rule_label: Option<String>,

    pub status: SessionStatus,

    #[sea_orm(column_type = "Text", nullable)]
    pub closed_reason: Option<String>,

    pub created_at: ChronoDateTimeUtc,

    pub expires_at: ChronoDateTimeUtc,

    pub last_activity: ChronoDateTimeUtc,

    pub closed_at: Option<ChronoDateTimeUtc>,
}

impl Model {
    /// The tunnel port as a socket port number
    pub fn port(&self) -> u16 {
        u16::try_from(self.tunnel_port).unwrap_or_default()
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// A session only becomes usable once its proxy route has been activated
    pub fn is_usable(&self) -> bool {
        self.is_active() && self.proxy_route.is_some()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
