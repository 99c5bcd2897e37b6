//! Migration to create the connections table.
//!
//! This migration creates the connections table which stores per-tenant,
//! per-user provider authorization records, including lifecycle status,
//! the monotonic authorization version, and the authorized scope set.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Connections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Connections::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Connections::TenantId).uuid().not_null())
                    .col(ColumnDef::new(Connections::Sub).text().not_null())
                    .col(ColumnDef::new(Connections::Provider).text().not_null())
                    .col(
                        ColumnDef::new(Connections::ExternalConnectionId)
                            .text()
                            .null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Connections::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Connections::ConnectionVersion)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(Connections::AuthorizedScopes)
                            .json_binary()
                            .null(),
                    )
                    .col(ColumnDef::new(Connections::AuthMode).text().null())
                    .col(
                        ColumnDef::new(Connections::ProviderAccount)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::LastAccessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::RevokedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Connections::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Storage-level guard for "at most one live connection per
        // (tenant, subject, provider)". Revoked rows are excluded so a new
        // authorization can follow a revocation. Raw SQL because the index
        // builder has no partial-index support; the statement is accepted by
        // both Postgres and SQLite.
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX idx_connections_live_triple \
                 ON connections (tenant_id, sub, provider) \
                 WHERE status IN ('pending', 'active')",
            )
            .await?;

        // Covering index for natural-key lookups across all statuses
        manager
            .create_index(
                Index::create()
                    .name("idx_connections_tenant_sub_provider")
                    .table(Connections::Table)
                    .col(Connections::TenantId)
                    .col(Connections::Sub)
                    .col(Connections::Provider)
                    .to_owned(),
            )
            .await?;

        // Index on tenant_id for tenant-scoped listings
        manager
            .create_index(
                Index::create()
                    .name("idx_connections_tenant_id")
                    .table(Connections::Table)
                    .col(Connections::TenantId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Drop indexes first
        manager
            .get_connection()
            .execute_unprepared("DROP INDEX idx_connections_live_triple")
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_connections_tenant_sub_provider")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(Index::drop().name("idx_connections_tenant_id").to_owned())
            .await?;

        // Then drop table
        manager
            .drop_table(Table::drop().table(Connections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
    TenantId,
    Sub,
    Provider,
    ExternalConnectionId,
    Status,
    ConnectionVersion,
    AuthorizedScopes,
    AuthMode,
    ProviderAccount,
    LastAccessedAt,
    RevokedAt,
    CreatedAt,
    UpdatedAt,
}
