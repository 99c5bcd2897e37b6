//! # Connections API Handlers
//!
//! Tenant-scoped connection management: creation (which opens a vault
//! authorization session), listing, retrieval, reconnect, and revocation.
//! Responses carry only non-confidential connection fields; the provider
//! account snapshot and vault identifiers never leave the service.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::error::{ApiError, IssuanceError};
use crate::lifecycle::ConnectionStatus;
use crate::models::connection;
use crate::repositories::NewConnection;
use crate::scopes::normalize_scopes;
use crate::server::AppState;
use crate::vault::SessionRequest;

/// Request body for creating a connection
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateConnectionRequest {
    /// Subject (end-user identity) authorizing the provider
    pub sub: String,
    /// Provider slug (e.g., "github")
    pub provider: String,
    /// Scopes to request from the provider
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Response for connection creation
#[derive(Debug, Serialize, ToSchema)]
pub struct CreateConnectionResponse {
    /// Identifier of the pending connection
    #[schema(value_type = String)]
    pub connection_id: Uuid,
    /// URL the end user must visit to complete the provider authorization
    pub authorization_url: String,
}

/// Request body for reconnecting a connection with a new scope set
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateConnectionRequest {
    pub sub: String,
    pub provider: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Response for a reconnect request
#[derive(Debug, Serialize, ToSchema)]
pub struct UpdateConnectionResponse {
    pub authorization_url: String,
}

/// Query parameters for connections listing
#[derive(Debug, Deserialize, IntoParams)]
pub struct ListConnectionsQuery {
    /// Optional subject filter
    pub user: Option<String>,
}

/// Non-confidential view of a connection for API responses
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectionInfo {
    #[schema(value_type = String)]
    pub id: Uuid,
    #[schema(value_type = String)]
    pub tenant_id: Uuid,
    pub sub: String,
    pub provider: String,
    /// Lifecycle status (pending|active|revoked)
    pub status: String,
    pub scopes: Vec<String>,
    pub auth_mode: Option<String>,
    pub last_accessed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<connection::Model> for ConnectionInfo {
    fn from(model: connection::Model) -> Self {
        let scopes = model.authorized_scopes_vec();
        Self {
            id: model.id,
            tenant_id: model.tenant_id,
            sub: model.sub,
            provider: model.provider,
            status: model.status,
            scopes,
            auth_mode: model.auth_mode,
            last_accessed_at: model.last_accessed_at.map(rfc3339),
            created_at: rfc3339(model.created_at),
            updated_at: rfc3339(model.updated_at),
        }
    }
}

fn rfc3339(dt: DateTimeWithTimeZone) -> String {
    let utc: DateTime<Utc> = dt.naive_utc().and_utc();
    utc.to_rfc3339()
}

/// Response wrapper for connections listing
#[derive(Debug, Serialize, ToSchema)]
pub struct ConnectionsResponse {
    pub connections: Vec<ConnectionInfo>,
    pub count: usize,
}

/// Response for connection revocation
#[derive(Debug, Serialize, ToSchema)]
pub struct DeleteConnectionResponse {
    pub deleted: bool,
}

/// Creates a pending connection and opens a vault authorization session
#[utoipa::path(
    post,
    path = "/v1/tenants/{tenant_id}/connections",
    params(("tenant_id" = String, Path, description = "Tenant identifier")),
    request_body = CreateConnectionRequest,
    responses(
        (status = 200, description = "Pending connection with authorization URL", body = CreateConnectionResponse),
        (status = 400, description = "Subject already has a live connection with this provider", body = ApiError),
        (status = 502, description = "Vault session could not be created", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn create_connection(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(request): Json<CreateConnectionRequest>,
) -> Result<Json<CreateConnectionResponse>, ApiError> {
    let scopes = normalize_scopes(&request.scopes);

    let model = state
        .repository
        .create(NewConnection {
            tenant_id,
            sub: request.sub.clone(),
            provider: request.provider.clone(),
            scopes: scopes.clone(),
            auth_mode: None,
        })
        .await?;

    let session = state
        .vault
        .create_session(&SessionRequest {
            provider: &request.provider,
            subject: &request.sub,
            tenant_id: &tenant_id.to_string(),
            connect_id: &model.id.to_string(),
            scopes: &scopes,
        })
        .await
        .map_err(IssuanceError::from)?;

    let authorization_url = state
        .vault
        .build_authorization_url(&request.provider, &session.token)
        .map_err(|err| {
            error!(error = %err, "Authorization URL construction failed");
            IssuanceError::Internal(anyhow::Error::new(err))
        })?;

    info!(%tenant_id, connection_id = %model.id, provider = %request.provider, "Created pending connection");

    Ok(Json(CreateConnectionResponse {
        connection_id: model.id,
        authorization_url,
    }))
}

/// Lists a tenant's connections, newest first
#[utoipa::path(
    get,
    path = "/v1/tenants/{tenant_id}/connections",
    params(
        ("tenant_id" = String, Path, description = "Tenant identifier"),
        ListConnectionsQuery
    ),
    responses(
        (status = 200, description = "Tenant connections", body = ConnectionsResponse)
    ),
    tag = "connections"
)]
pub async fn list_connections(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<ListConnectionsQuery>,
) -> Result<Json<ConnectionsResponse>, ApiError> {
    let models = state
        .repository
        .find_by_tenant(tenant_id, query.user.as_deref())
        .await?;

    let connections: Vec<ConnectionInfo> = models.into_iter().map(ConnectionInfo::from).collect();
    let count = connections.len();

    Ok(Json(ConnectionsResponse { connections, count }))
}

/// Retrieves a single connection
#[utoipa::path(
    get,
    path = "/v1/tenants/{tenant_id}/connections/{connection_id}",
    params(
        ("tenant_id" = String, Path, description = "Tenant identifier"),
        ("connection_id" = String, Path, description = "Connection identifier")
    ),
    responses(
        (status = 200, description = "Connection details", body = ConnectionInfo),
        (status = 404, description = "Connection not found", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn get_connection(
    State(state): State<AppState>,
    Path((tenant_id, connection_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ConnectionInfo>, ApiError> {
    let model = fetch_tenant_connection(&state, tenant_id, connection_id).await?;
    Ok(Json(ConnectionInfo::from(model)))
}

/// Opens a vault reconnect session to replace the authorized scope set
#[utoipa::path(
    put,
    path = "/v1/tenants/{tenant_id}/connections/{connection_id}",
    params(
        ("tenant_id" = String, Path, description = "Tenant identifier"),
        ("connection_id" = String, Path, description = "Connection identifier")
    ),
    request_body = UpdateConnectionRequest,
    responses(
        (status = 200, description = "Reconnect authorization URL", body = UpdateConnectionResponse),
        (status = 400, description = "Connection has no provider-side counterpart yet", body = ApiError),
        (status = 404, description = "Connection not found", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn update_connection(
    State(state): State<AppState>,
    Path((tenant_id, connection_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<UpdateConnectionRequest>,
) -> Result<Json<UpdateConnectionResponse>, ApiError> {
    let model = fetch_tenant_connection(&state, tenant_id, connection_id).await?;

    let Some(external_connection_id) = model.external_connection_id.as_deref() else {
        return Err(IssuanceError::InvalidState {
            status: model.status,
        }
        .into());
    };

    let scopes = normalize_scopes(&request.scopes);
    let session = state
        .vault
        .create_reconnect_session(
            external_connection_id,
            &SessionRequest {
                provider: &request.provider,
                subject: &request.sub,
                tenant_id: &tenant_id.to_string(),
                connect_id: &model.id.to_string(),
                scopes: &scopes,
            },
        )
        .await
        .map_err(IssuanceError::from)?;

    let authorization_url = state
        .vault
        .build_authorization_url(&request.provider, &session.token)
        .map_err(|err| IssuanceError::Internal(anyhow::Error::new(err)))?;

    Ok(Json(UpdateConnectionResponse { authorization_url }))
}

/// Revokes a connection after tearing down the provider-side credential
#[utoipa::path(
    delete,
    path = "/v1/tenants/{tenant_id}/connections/{connection_id}",
    params(
        ("tenant_id" = String, Path, description = "Tenant identifier"),
        ("connection_id" = String, Path, description = "Connection identifier")
    ),
    responses(
        (status = 200, description = "Connection revoked", body = DeleteConnectionResponse),
        (status = 404, description = "Connection not found", body = ApiError),
        (status = 502, description = "Vault teardown failed", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn delete_connection(
    State(state): State<AppState>,
    Path((tenant_id, connection_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<DeleteConnectionResponse>, ApiError> {
    let model = fetch_tenant_connection(&state, tenant_id, connection_id).await?;

    // Revocation is only recorded once the vault confirms the provider-side
    // teardown. A connection that never activated has nothing to tear down.
    if let Some(external_connection_id) = model.external_connection_id.as_deref() {
        let deleted = state
            .vault
            .delete_connection(&model.provider, external_connection_id)
            .await
            .map_err(IssuanceError::from)?;

        if !deleted {
            return Err(IssuanceError::ExternalService {
                service: "vault",
                source: anyhow::anyhow!("vault did not confirm connection teardown"),
            }
            .into());
        }
    }

    let revoked = state.repository.revoke(connection_id).await?;
    info!(
        %tenant_id,
        %connection_id,
        status = %revoked.status,
        "Connection revoked"
    );
    debug_assert_eq!(revoked.status, ConnectionStatus::Revoked.as_str());

    Ok(Json(DeleteConnectionResponse { deleted: true }))
}

async fn fetch_tenant_connection(
    state: &AppState,
    tenant_id: Uuid,
    connection_id: Uuid,
) -> Result<connection::Model, ApiError> {
    state
        .repository
        .find_by_id(connection_id)
        .await?
        .filter(|model| model.tenant_id == tenant_id)
        .ok_or_else(|| ApiError::from(IssuanceError::NotFound))
}
