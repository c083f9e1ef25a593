//! Database migrations

use sea_orm_migration::prelude::*;

mod m20260901_000001_create_tunnel_sessions;
mod m20260901_000002_create_firewalls;
mod m20260914_000001_create_grant_requests;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260901_000001_create_tunnel_sessions::Migration),
            Box::new(m20260901_000002_create_firewalls::Migration),
            Box::new(m20260914_000001_create_grant_requests::Migration),
        ]
    }
}
