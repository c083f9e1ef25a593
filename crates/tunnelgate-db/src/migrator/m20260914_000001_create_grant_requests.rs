//! Migration to create grant_requests, the queue used by the legacy
//! per-session firewall rule strategy

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(GrantRequests::Table)
                    .if_not_exists()
                    .col(string_len(GrantRequests::Id, 36).primary_key())
                    .col(string_len(GrantRequests::Target, 255).not_null())
                    .col(string_len(GrantRequests::Action, 32).not_null())
                    .col(string_len(GrantRequests::RuleLabel, 255).not_null())
                    .col(
                        string_len(GrantRequests::Status, 32)
                            .not_null()
                            .default("pending"),
                    )
                    .col(text_null(GrantRequests::Error))
                    .col(
                        timestamp_with_time_zone(GrantRequests::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(timestamp_with_time_zone_null(GrantRequests::CompletedAt))
                    .to_owned(),
            )
            .await?;

        // The agent polls pending requests per firewall
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_grant_requests_target_status")
                    .table(GrantRequests::Table)
                    .col(GrantRequests::Target)
                    .col(GrantRequests::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(GrantRequests::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum GrantRequests {
    #[sea_orm(iden = "grant_requests")]
    Table,
    Id,
    Target,
    Action,
    RuleLabel,
    Status,
    Error,
    CreatedAt,
    CompletedAt,
}
