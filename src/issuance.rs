//! Access issuance orchestration.
//!
//! Ties the delegation validator, lifecycle checks, scope authorizer, replay
//! guard, and vault client into the single issuance flow. The connection
//! reads and the last-accessed write share one transaction, so a concurrent
//! revoke or scope override cannot race ahead unseen; any failure before the
//! commit rolls the transaction back.

use chrono::{DateTime, Utc};
use sea_orm::DatabaseTransaction;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::delegation::DelegationTokenValidator;
use crate::error::IssuanceError;
use crate::lifecycle::ConnectionStatus;
use crate::models::connection;
use crate::replay::ReplayGuard;
use crate::repositories::ConnectionRepository;
use crate::scopes;
use crate::vault::{AccessMaterial, VaultClient, vendor_block};

/// Ephemeral access material returned to the caller. Never persisted.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AccessArtifact {
    pub access_token: String,
    /// Remaining lifetime in seconds, floored at zero.
    pub expires_in: i64,
    pub scopes: Vec<String>,
    /// Provider account metadata snapshot.
    pub vendor: JsonValue,
}

/// Orchestrates the delegation-token exchange for short-lived provider
/// access.
pub struct AccessIssuer {
    repository: ConnectionRepository,
    vault: Arc<VaultClient>,
    validator: Arc<DelegationTokenValidator>,
    replay: Arc<ReplayGuard>,
    default_access_lifetime_seconds: u64,
}

impl AccessIssuer {
    pub fn new(
        repository: ConnectionRepository,
        vault: Arc<VaultClient>,
        validator: Arc<DelegationTokenValidator>,
        replay: Arc<ReplayGuard>,
        default_access_lifetime_seconds: u64,
    ) -> Self {
        Self {
            repository,
            vault,
            validator,
            replay,
            default_access_lifetime_seconds,
        }
    }

    /// Exchanges a delegation token for an access artifact.
    pub async fn issue(
        &self,
        tenant_id: Uuid,
        connection_id: Uuid,
        delegation_token: &str,
        min_ttl_seconds: u64,
    ) -> Result<AccessArtifact, IssuanceError> {
        let txn = self.repository.begin().await?;
        let result = self
            .issue_in(&txn, tenant_id, connection_id, delegation_token, min_ttl_seconds)
            .await;

        match result {
            Ok(artifact) => {
                txn.commit().await?;
                metrics::counter!("broker_issuance_success_total").increment(1);
                info!(
                    %tenant_id,
                    %connection_id,
                    expires_in = artifact.expires_in,
                    "Issued access artifact"
                );
                Ok(artifact)
            }
            Err(err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    tracing::error!(error = ?rollback_err, "Issuance rollback failed");
                }
                metrics::counter!(
                    "broker_issuance_failure_total",
                    "code" => err.error_code()
                )
                .increment(1);
                Err(err)
            }
        }
    }

    async fn issue_in(
        &self,
        txn: &DatabaseTransaction,
        tenant_id: Uuid,
        connection_id: Uuid,
        delegation_token: &str,
        min_ttl_seconds: u64,
    ) -> Result<AccessArtifact, IssuanceError> {
        let conn = self
            .repository
            .find_by_id_in(txn, connection_id)
            .await?
            .filter(|conn| conn.tenant_id == tenant_id)
            .ok_or(IssuanceError::NotFound)?;

        let validated = self
            .validator
            .validate(delegation_token, tenant_id, connection_id)?;

        if conn.sub != validated.subject {
            return Err(IssuanceError::Forbidden(
                "Connection does not belong to authenticated subject".to_string(),
            ));
        }
        // Defense in depth on top of the path-scoped lookup above.
        if conn.tenant_id != validated.tenant_id {
            return Err(IssuanceError::Forbidden(
                "Connection does not belong to tenant".to_string(),
            ));
        }

        let status: ConnectionStatus = conn
            .status
            .parse()
            .map_err(|err| IssuanceError::Internal(anyhow::Error::new(err)))?;
        if status != ConnectionStatus::Active {
            return Err(IssuanceError::InvalidState {
                status: status.as_str().to_string(),
            });
        }

        if let Some(snapshot) = validated.connection_version {
            if snapshot != i64::from(conn.connection_version) {
                return Err(IssuanceError::VersionConflict);
            }
        }

        let effective_scopes =
            scopes::authorize(&validated.scopes, &conn.authorized_scopes_vec())?;

        self.replay.consume(&validated.jti, validated.exp)?;

        let external_connection_id = conn
            .external_connection_id
            .as_deref()
            .ok_or(IssuanceError::AccessMaterialUnavailable)?;

        let material = self
            .vault
            .get_access_material(&conn.provider, external_connection_id)
            .await?
            .ok_or(IssuanceError::AccessMaterialUnavailable)?;

        let material = self
            .refresh_if_short(&conn, external_connection_id, material, min_ttl_seconds)
            .await;

        let expires_in = remaining_lifetime(
            material.expires_at,
            Utc::now(),
            self.default_access_lifetime_seconds,
        );

        self.repository
            .touch_last_accessed_in(txn, connection_id)
            .await?;

        Ok(AccessArtifact {
            access_token: material.access_token,
            expires_in,
            scopes: effective_scopes,
            vendor: vendor_block(conn.provider_account.as_ref()),
        })
    }

    /// Best-effort refresh when the material is close to expiry. Failure is
    /// logged and the still-valid material returned unchanged.
    async fn refresh_if_short(
        &self,
        conn: &connection::Model,
        external_connection_id: &str,
        material: AccessMaterial,
        min_ttl_seconds: u64,
    ) -> AccessMaterial {
        let remaining = remaining_lifetime(
            material.expires_at,
            Utc::now(),
            self.default_access_lifetime_seconds,
        );
        if remaining >= min_ttl_seconds as i64 {
            return material;
        }

        info!(
            connection_id = %conn.id,
            remaining,
            min_ttl_seconds,
            "Access material below requested TTL, refreshing"
        );

        match self
            .vault
            .refresh_access_material(&conn.provider, external_connection_id)
            .await
        {
            Ok(Some(refreshed)) => refreshed,
            Ok(None) => {
                warn!(connection_id = %conn.id, "Vault reported no material on refresh");
                material
            }
            Err(err) => {
                warn!(connection_id = %conn.id, error = %err, "Access material refresh failed");
                material
            }
        }
    }
}

/// Remaining lifetime in whole seconds, floored at zero. An absent expiry
/// falls back to the configured default lifetime.
fn remaining_lifetime(
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    default_seconds: u64,
) -> i64 {
    match expires_at {
        Some(expires_at) => (expires_at - now).num_seconds().max(0),
        None => default_seconds as i64,
    }
}
