//! Connection repository
//!
//! Encapsulates SeaORM operations for the connections table. Every lifecycle
//! transition (create, activate, revoke, scope override) is a single
//! transaction: read the current row, validate the transition, write the new
//! state, then commit. Failures roll back before the error propagates.

use anyhow::anyhow;
use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, QueryOrder, Set, SqlErr, TransactionTrait,
};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::IssuanceError;
use crate::lifecycle::ConnectionStatus;
use crate::models::connection::{self, Entity as Connection};
use crate::scopes::normalize_scopes;

/// Fields for a new pending connection.
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub tenant_id: Uuid,
    pub sub: String,
    pub provider: String,
    pub scopes: Vec<String>,
    pub auth_mode: Option<String>,
}

/// An activation event received from the vault.
///
/// Correlated to a connection by the opaque tag attached at creation time
/// when present, otherwise by the natural key (subject, provider, tenant).
#[derive(Debug, Clone)]
pub struct ActivationEvent {
    pub correlation_id: Option<Uuid>,
    pub sub: String,
    pub provider: String,
    pub tenant_id: Uuid,
    pub external_connection_id: String,
    pub provider_account: Option<JsonValue>,
}

/// Repository for connection database operations
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    pub db: Arc<DatabaseConnection>,
}

impl ConnectionRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Opens a transaction for a multi-step read sequence (issuance).
    pub async fn begin(&self) -> Result<DatabaseTransaction, IssuanceError> {
        Ok(self.db.begin().await?)
    }

    /// Finds a connection by its ID.
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<connection::Model>, IssuanceError> {
        self.find_by_id_in(&*self.db, id).await
    }

    /// Finds a connection by its ID on a caller-supplied connection or
    /// transaction.
    pub async fn find_by_id_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: Uuid,
    ) -> Result<Option<connection::Model>, IssuanceError> {
        Ok(Connection::find_by_id(id).one(conn).await?)
    }

    /// Lists a tenant's connections newest-first, optionally filtered to one
    /// subject.
    pub async fn find_by_tenant(
        &self,
        tenant_id: Uuid,
        sub: Option<&str>,
    ) -> Result<Vec<connection::Model>, IssuanceError> {
        let mut query = Connection::find()
            .filter(connection::Column::TenantId.eq(tenant_id))
            .order_by_desc(connection::Column::CreatedAt);

        if let Some(sub) = sub {
            query = query.filter(connection::Column::Sub.eq(sub));
        }

        Ok(query.all(&*self.db).await?)
    }

    /// Creates a pending connection, enforcing at most one live connection
    /// per (tenant, subject, provider).
    ///
    /// An existing pending row is reused rather than duplicated; an existing
    /// active row rejects the request. The check is racy on its own, so the
    /// partial unique index over live rows backstops it: when a concurrent
    /// creation wins the race the insert fails, and the surviving row decides
    /// the outcome.
    pub async fn create(&self, new: NewConnection) -> Result<connection::Model, IssuanceError> {
        let txn = self.db.begin().await?;
        let result = self.create_in(&txn, new.clone()).await;
        let model = match finish(txn, result).await {
            Ok(model) => model,
            Err(IssuanceError::AlreadyConnected) => {
                let existing = self
                    .find_newest_for_triple(&*self.db, new.tenant_id, &new.sub, &new.provider)
                    .await?;
                match existing {
                    Some(model) if status_of(&model)? == ConnectionStatus::Pending => model,
                    _ => return Err(IssuanceError::AlreadyConnected),
                }
            }
            Err(err) => return Err(err),
        };
        metrics::counter!("broker_connections_created_total").increment(1);
        Ok(model)
    }

    async fn find_newest_for_triple<C: ConnectionTrait>(
        &self,
        conn: &C,
        tenant_id: Uuid,
        sub: &str,
        provider: &str,
    ) -> Result<Option<connection::Model>, IssuanceError> {
        Ok(Connection::find()
            .filter(connection::Column::TenantId.eq(tenant_id))
            .filter(connection::Column::Sub.eq(sub))
            .filter(connection::Column::Provider.eq(provider))
            .order_by_desc(connection::Column::CreatedAt)
            .one(conn)
            .await?)
    }

    async fn create_in(
        &self,
        txn: &DatabaseTransaction,
        new: NewConnection,
    ) -> Result<connection::Model, IssuanceError> {
        let existing = self
            .find_newest_for_triple(txn, new.tenant_id, &new.sub, &new.provider)
            .await?;

        if let Some(model) = existing {
            match status_of(&model)? {
                ConnectionStatus::Active => return Err(IssuanceError::AlreadyConnected),
                ConnectionStatus::Pending => return Ok(model),
                ConnectionStatus::Revoked => {}
            }
        }

        let id = Uuid::new_v4();
        let now: DateTimeWithTimeZone = Utc::now().into();
        let scopes = normalize_scopes(&new.scopes);

        let active = connection::ActiveModel {
            id: Set(id),
            tenant_id: Set(new.tenant_id),
            sub: Set(new.sub),
            provider: Set(new.provider),
            external_connection_id: Set(None),
            status: Set(ConnectionStatus::Pending.as_str().to_string()),
            connection_version: Set(1),
            authorized_scopes: Set(Some(json!(scopes))),
            auth_mode: Set(new.auth_mode.or_else(|| Some("oauth".to_string()))),
            provider_account: Set(None),
            last_accessed_at: Set(None),
            revoked_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        active.insert(txn).await.map_err(|err| match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => IssuanceError::AlreadyConnected,
            _ => IssuanceError::from(err),
        })?;

        // Re-fetch by ID so database-populated columns read back correctly
        // on every backend.
        let fetched = Connection::find_by_id(id).one(txn).await?;
        fetched.ok_or_else(|| IssuanceError::Internal(anyhow!("connection not persisted")))
    }

    /// Applies an activation event. Returns `None` when no matching
    /// connection exists (the event is dropped, not an error) and the
    /// unchanged row when the connection is already active.
    pub async fn activate(
        &self,
        event: ActivationEvent,
    ) -> Result<Option<connection::Model>, IssuanceError> {
        let txn = self.db.begin().await?;
        let result = self.activate_in(&txn, event).await;
        let activated = finish(txn, result).await?;
        if activated.is_some() {
            metrics::counter!("broker_connections_activated_total").increment(1);
        }
        Ok(activated)
    }

    async fn activate_in(
        &self,
        txn: &DatabaseTransaction,
        event: ActivationEvent,
    ) -> Result<Option<connection::Model>, IssuanceError> {
        let found = match event.correlation_id {
            Some(id) => Connection::find_by_id(id).one(txn).await?,
            None => {
                Connection::find()
                    .filter(connection::Column::Sub.eq(event.sub.as_str()))
                    .filter(connection::Column::Provider.eq(event.provider.as_str()))
                    .filter(connection::Column::TenantId.eq(event.tenant_id))
                    .order_by_desc(connection::Column::CreatedAt)
                    .one(txn)
                    .await?
            }
        };

        let Some(model) = found else {
            tracing::warn!(
                provider = %event.provider,
                tenant_id = %event.tenant_id,
                "Activation event matched no connection, dropping"
            );
            return Ok(None);
        };

        let status = status_of(&model)?;
        if status == ConnectionStatus::Active {
            return Ok(Some(model));
        }
        if !status.can_activate() {
            tracing::warn!(
                connection_id = %model.id,
                %status,
                "Activation event for a non-activatable connection, dropping"
            );
            return Ok(None);
        }

        let mut active: connection::ActiveModel = model.into();
        active.status = Set(ConnectionStatus::Active.as_str().to_string());
        active.external_connection_id = Set(Some(event.external_connection_id));
        if event.provider_account.is_some() {
            active.provider_account = Set(event.provider_account);
        }
        active.updated_at = Set(Utc::now().into());

        Ok(Some(active.update(txn).await?))
    }

    /// Revokes a connection. Revoking an already-revoked connection is an
    /// idempotent no-op.
    pub async fn revoke(&self, id: Uuid) -> Result<connection::Model, IssuanceError> {
        let txn = self.db.begin().await?;
        let result = self.revoke_in(&txn, id).await;
        let model = finish(txn, result).await?;
        metrics::counter!("broker_connections_revoked_total").increment(1);
        Ok(model)
    }

    async fn revoke_in(
        &self,
        txn: &DatabaseTransaction,
        id: Uuid,
    ) -> Result<connection::Model, IssuanceError> {
        let model = Connection::find_by_id(id)
            .one(txn)
            .await?
            .ok_or(IssuanceError::NotFound)?;

        if status_of(&model)?.is_terminal() {
            return Ok(model);
        }

        let now: DateTimeWithTimeZone = Utc::now().into();
        let mut active: connection::ActiveModel = model.into();
        active.status = Set(ConnectionStatus::Revoked.as_str().to_string());
        active.revoked_at = Set(Some(now));
        active.updated_at = Set(now);

        Ok(active.update(txn).await?)
    }

    /// Replaces the authorized scope set of the connection the vault knows
    /// by `external_connection_id` and increments the authorization version
    /// by exactly 1. Returns `None` when no matching connection exists.
    pub async fn override_scopes(
        &self,
        external_connection_id: &str,
        scopes: Vec<String>,
    ) -> Result<Option<connection::Model>, IssuanceError> {
        let txn = self.db.begin().await?;
        let result = self
            .override_scopes_in(&txn, external_connection_id, scopes)
            .await;
        let updated = finish(txn, result).await?;
        if updated.is_some() {
            metrics::counter!("broker_scope_overrides_total").increment(1);
        }
        Ok(updated)
    }

    async fn override_scopes_in(
        &self,
        txn: &DatabaseTransaction,
        external_connection_id: &str,
        scopes: Vec<String>,
    ) -> Result<Option<connection::Model>, IssuanceError> {
        let found = Connection::find()
            .filter(connection::Column::ExternalConnectionId.eq(external_connection_id))
            .one(txn)
            .await?;

        let Some(model) = found else {
            tracing::warn!(
                external_connection_id,
                "Scope override matched no connection, dropping"
            );
            return Ok(None);
        };

        let status = status_of(&model)?;
        if !status.allows_scope_override() {
            return Err(IssuanceError::InvalidState {
                status: status.as_str().to_string(),
            });
        }

        let scopes = normalize_scopes(&scopes);
        let version = model.connection_version + 1;

        let mut active: connection::ActiveModel = model.into();
        active.authorized_scopes = Set(Some(json!(scopes)));
        active.connection_version = Set(version);
        active.updated_at = Set(Utc::now().into());

        Ok(Some(active.update(txn).await?))
    }

    /// Stamps the last-accessed timestamp on a caller-supplied transaction,
    /// so an issuance read sequence and its metadata write commit together.
    pub async fn touch_last_accessed_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: Uuid,
    ) -> Result<(), IssuanceError> {
        let model = Connection::find_by_id(id)
            .one(conn)
            .await?
            .ok_or(IssuanceError::NotFound)?;

        let now: DateTimeWithTimeZone = Utc::now().into();
        let mut active: connection::ActiveModel = model.into();
        active.last_accessed_at = Set(Some(now));
        active.updated_at = Set(now);
        active.update(conn).await?;

        Ok(())
    }
}

fn status_of(model: &connection::Model) -> Result<ConnectionStatus, IssuanceError> {
    model
        .status
        .parse()
        .map_err(|err| IssuanceError::Internal(anyhow::Error::new(err)))
}

async fn finish<T>(
    txn: DatabaseTransaction,
    result: Result<T, IssuanceError>,
) -> Result<T, IssuanceError> {
    match result {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = txn.rollback().await {
                tracing::error!(error = ?rollback_err, "Transaction rollback failed");
            }
            Err(err)
        }
    }
}
