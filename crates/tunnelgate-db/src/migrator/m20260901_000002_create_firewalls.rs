//! Migration to create the firewalls table read by the tunnel manager

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Firewalls::Table)
                    .if_not_exists()
                    .col(string_len(Firewalls::Id, 255).primary_key())
                    .col(string_len(Firewalls::Hostname, 255).not_null())
                    .col(integer(Firewalls::SshPort).not_null().default(22))
                    .col(
                        string_len(Firewalls::SshUser, 64)
                            .not_null()
                            .default("root"),
                    )
                    .col(integer(Firewalls::WebPort).not_null().default(443))
                    .col(text_null(Firewalls::IdentityFile))
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Firewalls::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Firewalls {
    #[sea_orm(iden = "firewalls")]
    Table,
    Id,
    Hostname,
    SshPort,
    SshUser,
    WebPort,
    IdentityFile,
}
