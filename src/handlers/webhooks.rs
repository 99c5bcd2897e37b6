//! # Vault Webhook Handler
//!
//! Receives lifecycle events from the token vault: connection activation
//! after the end user completes the provider authorization, and scope
//! overrides after a reconnect. The raw body is verified against the vault
//! signature before any parsing. Events that match no connection are
//! acknowledged rather than retried, so the vault does not redeliver them
//! forever.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ApiError, unauthorized};
use crate::repositories::ActivationEvent;
use crate::scopes::normalize_scopes;
use crate::server::AppState;

const SIGNATURE_HEADER: &str = "x-vault-signature";

/// Acknowledgement returned to the vault
#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

impl WebhookAck {
    fn received() -> Self {
        Self {
            received: true,
            processed: None,
            error: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    fn rejected(error: impl Into<String>) -> Self {
        Self {
            received: true,
            processed: Some(false),
            error: Some(error.into()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload {
    #[serde(rename = "type")]
    kind: Option<String>,
    operation: Option<String>,
    connection_id: Option<String>,
    provider: Option<String>,
    end_user: Option<EndUser>,
    provider_account: Option<JsonValue>,
    scopes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndUser {
    end_user_id: Option<String>,
    organization_id: Option<String>,
    tags: Option<Tags>,
}

#[derive(Debug, Deserialize)]
struct Tags {
    #[serde(rename = "connectId")]
    connect_id: Option<String>,
    scopes: Option<String>,
}

/// Handles lifecycle events delivered by the token vault
#[utoipa::path(
    post,
    path = "/v1/webhooks/vault",
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Event acknowledged", body = WebhookAck),
        (status = 400, description = "Malformed event payload", body = WebhookAck),
        (status = 401, description = "Signature verification failed", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn vault_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAck>), ApiError> {
    if state.vault.webhook_verification_enabled() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");

        if !state.vault.verify_webhook_signature(signature, &body) {
            warn!("Vault webhook signature verification failed");
            return Err(unauthorized(Some("Invalid webhook signature")));
        }
    } else {
        warn!("Vault webhook secret not configured, skipping signature verification");
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => {
            return Ok((
                StatusCode::BAD_REQUEST,
                Json(WebhookAck::rejected("Invalid payload")),
            ));
        }
    };

    let Some(kind) = payload.kind.as_deref() else {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(WebhookAck::rejected("Invalid payload - missing type field")),
        ));
    };

    if kind != "auth" {
        info!(kind, "Ignoring unknown vault webhook type");
        return Ok((StatusCode::OK, Json(WebhookAck::received())));
    }

    let Some(external_connection_id) = payload.connection_id.clone() else {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(WebhookAck::rejected("Missing connectionId")),
        ));
    };

    match payload.operation.as_deref() {
        Some("creation") => handle_creation(&state, external_connection_id, payload).await,
        Some("override") => handle_override(&state, external_connection_id, payload).await,
        operation => {
            info!(?operation, "Ignoring unhandled auth operation");
            Ok((StatusCode::OK, Json(WebhookAck::received())))
        }
    }
}

async fn handle_creation(
    state: &AppState,
    external_connection_id: String,
    payload: WebhookPayload,
) -> Result<(StatusCode, Json<WebhookAck>), ApiError> {
    let Some(end_user) = payload.end_user else {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(WebhookAck::rejected("Missing endUser")),
        ));
    };
    let (Some(sub), Some(organization_id), Some(provider)) = (
        end_user.end_user_id,
        end_user.organization_id,
        payload.provider,
    ) else {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(WebhookAck::rejected("Missing endUser or provider fields")),
        ));
    };

    let Ok(tenant_id) = Uuid::parse_str(&organization_id) else {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(WebhookAck::rejected("organizationId is not a valid UUID")),
        ));
    };

    let correlation_id = end_user
        .tags
        .as_ref()
        .and_then(|tags| tags.connect_id.as_deref())
        .and_then(|id| Uuid::parse_str(id).ok());

    let activated = state
        .repository
        .activate(ActivationEvent {
            correlation_id,
            sub,
            provider,
            tenant_id,
            external_connection_id,
            provider_account: payload.provider_account,
        })
        .await;

    match activated {
        Ok(Some(model)) => {
            info!(connection_id = %model.id, %tenant_id, "Connection activated");
            Ok((StatusCode::OK, Json(WebhookAck::received())))
        }
        Ok(None) => Ok((StatusCode::OK, Json(WebhookAck::received()))),
        Err(err) => {
            tracing::error!(error = %err, "Activation event processing failed");
            // Acknowledge anyway so the vault does not retry indefinitely.
            Ok((
                StatusCode::OK,
                Json(WebhookAck::rejected("Internal error processing webhook")),
            ))
        }
    }
}

async fn handle_override(
    state: &AppState,
    external_connection_id: String,
    payload: WebhookPayload,
) -> Result<(StatusCode, Json<WebhookAck>), ApiError> {
    let scopes = payload.scopes.map(|scopes| normalize_scopes(&scopes)).or_else(|| {
        payload
            .end_user
            .as_ref()
            .and_then(|end_user| end_user.tags.as_ref())
            .and_then(|tags| tags.scopes.as_deref())
            .map(|joined| normalize_scopes(joined.split_whitespace()))
    });

    let Some(scopes) = scopes else {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(WebhookAck::rejected("Missing scopes for override")),
        ));
    };

    match state
        .repository
        .override_scopes(&external_connection_id, scopes)
        .await
    {
        Ok(Some(model)) => {
            info!(
                connection_id = %model.id,
                connection_version = model.connection_version,
                "Authorized scopes replaced"
            );
            Ok((StatusCode::OK, Json(WebhookAck::received())))
        }
        Ok(None) => Ok((StatusCode::OK, Json(WebhookAck::received()))),
        Err(crate::error::IssuanceError::InvalidState { status }) => Ok((
            StatusCode::BAD_REQUEST,
            Json(WebhookAck::rejected(format!(
                "Scope override not allowed for {status} connection"
            ))),
        )),
        Err(err) => {
            tracing::error!(error = %err, "Scope override processing failed");
            Ok((
                StatusCode::OK,
                Json(WebhookAck::rejected("Internal error processing webhook")),
            ))
        }
    }
}
