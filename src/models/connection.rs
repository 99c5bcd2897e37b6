//! Connection entity model
//!
//! This module contains the SeaORM entity model for the connections table,
//! which stores per-tenant, per-user authorizations of external providers.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Connection entity representing one user's authorization of one provider
/// within one tenant
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    /// Unique identifier for the connection (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Tenant identifier for multi-tenancy
    pub tenant_id: Uuid,

    /// Subject (end-user identity) that authorized the provider
    pub sub: String,

    /// Provider slug this connection belongs to
    pub provider: String,

    /// Provider-side connection identifier, assigned once the vault completes
    /// the authorization handshake
    pub external_connection_id: Option<String>,

    /// Lifecycle status (pending|active|revoked)
    pub status: String,

    /// Authorization version, incremented on every authorized-scope change
    pub connection_version: i32,

    /// Authorized scopes (lowercase strings, stored as JSON array)
    #[sea_orm(column_type = "JsonBinary")]
    pub authorized_scopes: Option<JsonValue>,

    /// Authorization mode (e.g., "oauth")
    pub auth_mode: Option<String>,

    /// Provider account metadata supplied at activation (opaque bag)
    #[sea_orm(column_type = "JsonBinary")]
    pub provider_account: Option<JsonValue>,

    /// Timestamp of the most recent access issuance against this connection
    pub last_accessed_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the connection was revoked
    pub revoked_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the connection was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the connection was last updated
    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Authorized scope set as owned strings; an absent column reads as empty.
    pub fn authorized_scopes_vec(&self) -> Vec<String> {
        self.authorized_scopes
            .as_ref()
            .and_then(|value| value.as_array())
            .map(|scopes| {
                scopes
                    .iter()
                    .filter_map(|scope| scope.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
