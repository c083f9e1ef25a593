//! Read-only view of the firewall inventory

use async_trait::async_trait;
use sea_orm::{DatabaseConnection, EntityTrait};
use serde::Serialize;
use std::path::PathBuf;
use tunnelgate_db::entities::firewall;

use crate::error::TunnelError;

/// Where and how to open a tunnel to one firewall
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirewallEndpoint {
    pub id: String,
    pub hostname: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub web_port: u16,
    pub identity_file: Option<PathBuf>,
}

impl TryFrom<firewall::Model> for FirewallEndpoint {
    type Error = TunnelError;

    fn try_from(model: firewall::Model) -> Result<Self, Self::Error> {
        let port = |value: i32, field: &str| {
            u16::try_from(value)
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| {
                    TunnelError::InvalidConfig(format!(
                        "firewall {} has invalid {} {}",
                        model.id, field, value
                    ))
                })
        };

        Ok(Self {
            ssh_port: port(model.ssh_port, "ssh_port")?,
            web_port: port(model.web_port, "web_port")?,
            identity_file: model.identity_file.clone().map(PathBuf::from),
            id: model.id,
            hostname: model.hostname,
            ssh_user: model.ssh_user,
        })
    }
}

#[async_trait]
pub trait FirewallRegistry: Send + Sync {
    async fn lookup(&self, target: &str) -> Result<Option<FirewallEndpoint>, TunnelError>;
}

/// Registry backed by the shared `firewalls` table
#[derive(Clone, Debug)]
pub struct DbFirewallRegistry {
    db: DatabaseConnection,
}

impl DbFirewallRegistry {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl FirewallRegistry for DbFirewallRegistry {
    async fn lookup(&self, target: &str) -> Result<Option<FirewallEndpoint>, TunnelError> {
        firewall::Entity::find_by_id(target)
            .one(&self.db)
            .await?
            .map(FirewallEndpoint::try_from)
            .transpose()
    }
}
