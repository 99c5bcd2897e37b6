//! # Token Issuance Handler
//!
//! Exchanges a delegation token for short-lived provider access material.
//! All of the validation and transaction handling lives in
//! [`crate::issuance::AccessIssuer`]; this handler only adapts the HTTP
//! surface.

use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ApiError;
use crate::issuance::AccessArtifact;
use crate::server::AppState;

/// Request body for access issuance
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssueTokenRequest {
    /// Delegation token minted by the trusted upstream
    pub delegation_token: String,
    /// Minimum remaining lifetime the caller needs, in seconds
    pub min_ttl_seconds: Option<u64>,
}

/// Issues a short-lived provider access token for an active connection
#[utoipa::path(
    post,
    path = "/v1/tenants/{tenant_id}/connections/{connection_id}/token",
    params(
        ("tenant_id" = String, Path, description = "Tenant identifier"),
        ("connection_id" = String, Path, description = "Connection identifier")
    ),
    request_body = IssueTokenRequest,
    responses(
        (status = 200, description = "Access artifact", body = AccessArtifact),
        (status = 400, description = "Connection not active or version conflict", body = ApiError),
        (status = 401, description = "Delegation token rejected", body = ApiError),
        (status = 403, description = "Subject or scope not authorized", body = ApiError),
        (status = 404, description = "Connection or access material not found", body = ApiError),
        (status = 502, description = "Vault error", body = ApiError),
        (status = 504, description = "Vault timeout", body = ApiError)
    ),
    tag = "tokens"
)]
pub async fn issue_access_token(
    State(state): State<AppState>,
    Path((tenant_id, connection_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<IssueTokenRequest>,
) -> Result<Json<AccessArtifact>, ApiError> {
    let min_ttl_seconds = request
        .min_ttl_seconds
        .unwrap_or(state.config.issuance.default_min_ttl_seconds);

    let artifact = state
        .issuer
        .issue(
            tenant_id,
            connection_id,
            &request.delegation_token,
            min_ttl_seconds,
        )
        .await?;

    Ok(Json(artifact))
}
