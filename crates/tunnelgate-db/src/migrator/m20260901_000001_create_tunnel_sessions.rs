//! Migration to create the tunnel_sessions table
//!
//! Port occupancy and the one-active-session-per-key rule are enforced with
//! partial unique indexes so that concurrent invocations cannot both win.

use sea_orm_migration::sea_orm::ConnectionTrait;
use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TunnelSessions::Table)
                    .if_not_exists()
                    .col(string_len(TunnelSessions::Id, 36).primary_key())
                    .col(string_len(TunnelSessions::Target, 255).not_null())
                    .col(string_len(TunnelSessions::SourceIp, 64).not_null())
                    .col(integer(TunnelSessions::TunnelPort).not_null())
                    .col(string_len_null(TunnelSessions::ProxyRoute, 255))
                    .col(string_len_null(TunnelSessions::RuleLabel, 255))
                    .col(
                        string_len(TunnelSessions::Status, 32)
                            .not_null()
                            .default("active"),
                    )
                    .col(text_null(TunnelSessions::ClosedReason))
                    .col(
                        timestamp_with_time_zone(TunnelSessions::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(timestamp_with_time_zone(TunnelSessions::ExpiresAt).not_null())
                    .col(timestamp_with_time_zone(TunnelSessions::LastActivity).not_null())
                    .col(timestamp_with_time_zone_null(TunnelSessions::ClosedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnel_sessions_status")
                    .table(TunnelSessions::Table)
                    .col(TunnelSessions::Status)
                    .to_owned(),
            )
            .await?;

        // Partial indexes: both SQLite and PostgreSQL accept this form verbatim.
        let db = manager.get_connection();
        db.execute_unprepared(
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_tunnel_sessions_active_tunnel_port \
             ON tunnel_sessions (tunnel_port) WHERE status = 'active'",
        )
        .await?;
        db.execute_unprepared(
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_tunnel_sessions_active_target_source \
             ON tunnel_sessions (target, source_ip) WHERE status = 'active'",
        )
        .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TunnelSessions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TunnelSessions {
    #[sea_orm(iden = "tunnel_sessions")]
    Table,
    Id,
    Target,
    SourceIp,
    TunnelPort,
    ProxyRoute,
    RuleLabel,
    Status,
    ClosedReason,
    CreatedAt,
    ExpiresAt,
    LastActivity,
    ClosedAt,
}
