//! HTTP client for the external token vault.
//!
//! The vault keeps the long-lived provider credentials; this service only
//! ever sees short-lived access material fetched on demand. Every call is
//! bounded by the configured timeout, and webhook payloads from the vault
//! are authenticated with an HMAC-SHA256 signature over the raw body.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::VaultConfig;
use crate::error::IssuanceError;

type HmacSha256 = Hmac<Sha256>;

/// Vault call failures.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault request timed out")]
    Timeout,

    #[error("vault request failed: {0}")]
    Network(reqwest::Error),

    #[error("vault returned unexpected status {status} for {operation}")]
    UnexpectedStatus {
        operation: &'static str,
        status: StatusCode,
    },

    #[error("vault response could not be decoded: {0}")]
    Decode(#[source] reqwest::Error),

    #[error("vault URL is invalid: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("vault client could not be built: {0}")]
    Build(reqwest::Error),
}

impl From<reqwest::Error> for VaultError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            VaultError::Timeout
        } else {
            VaultError::Network(err)
        }
    }
}

impl From<VaultError> for IssuanceError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Timeout => IssuanceError::ExternalTimeout { service: "vault" },
            other => IssuanceError::ExternalService {
                service: "vault",
                source: anyhow::Error::new(other),
            },
        }
    }
}

/// A newly created authorization session at the vault.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectSession {
    pub token: String,
    pub expires_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConnectSessionEnvelope {
    data: ConnectSession,
}

/// Short-lived access material held by the vault for one provider connection.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessMaterial {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ConnectionEnvelope {
    credentials: AccessMaterial,
}

/// Parameters for opening a new authorization session.
pub struct SessionRequest<'a> {
    pub provider: &'a str,
    pub subject: &'a str,
    pub tenant_id: &'a str,
    /// Correlation tag carried back on the activation webhook.
    pub connect_id: &'a str,
    pub scopes: &'a [String],
}

pub struct VaultClient {
    http: reqwest::Client,
    api_url: String,
    auth_url: String,
    webhook_secret: Option<String>,
}

impl VaultClient {
    pub fn from_config(config: &VaultConfig) -> Result<Self, VaultError> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(secret_key) = config.secret_key.as_deref() {
            let mut value =
                reqwest::header::HeaderValue::from_str(&format!("Bearer {secret_key}"))
                    .map_err(|_| VaultError::UnexpectedStatus {
                        operation: "configure",
                        status: StatusCode::UNAUTHORIZED,
                    })?;
            value.set_sensitive(true);
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .default_headers(headers)
            .build()
            .map_err(VaultError::Build)?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            auth_url: config.auth_url.trim_end_matches('/').to_string(),
            webhook_secret: config.webhook_secret.clone(),
        })
    }

    /// Opens an authorization session for a new connection.
    pub async fn create_session(
        &self,
        request: &SessionRequest<'_>,
    ) -> Result<ConnectSession, VaultError> {
        let body = json!({
            "end_user": {
                "id": request.subject,
                "tags": { "connectId": request.connect_id },
            },
            "organization": { "id": request.tenant_id },
            "allowed_integrations": [request.provider],
            "integrations_config_defaults": {
                request.provider: { "user_scopes": request.scopes.join(" ") },
            },
        });

        let response = self
            .http
            .post(format!("{}/connect/sessions", self.api_url))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(VaultError::UnexpectedStatus {
                operation: "create_session",
                status: response.status(),
            });
        }

        let envelope: ConnectSessionEnvelope = response.json().await.map_err(VaultError::Decode)?;
        Ok(envelope.data)
    }

    /// Opens a reconnect session against an existing provider connection,
    /// used when the authorized scope set changes.
    pub async fn create_reconnect_session(
        &self,
        external_connection_id: &str,
        request: &SessionRequest<'_>,
    ) -> Result<ConnectSession, VaultError> {
        let body = json!({
            "connection_id": external_connection_id,
            "integration_id": request.provider,
            "end_user": {
                "id": request.subject,
                "tags": { "connectId": request.connect_id },
            },
            "organization": { "id": request.tenant_id },
            "integrations_config_defaults": {
                request.provider: { "user_scopes": request.scopes.join(" ") },
            },
        });

        let response = self
            .http
            .post(format!("{}/connect/sessions/reconnect", self.api_url))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(VaultError::UnexpectedStatus {
                operation: "create_reconnect_session",
                status: response.status(),
            });
        }

        let envelope: ConnectSessionEnvelope = response.json().await.map_err(VaultError::Decode)?;
        Ok(envelope.data)
    }

    /// URL the end user is redirected to for the provider authorization flow.
    pub fn build_authorization_url(
        &self,
        provider: &str,
        session_token: &str,
    ) -> Result<String, VaultError> {
        let mut url = Url::parse(&format!("{}/{}", self.auth_url, provider))?;
        url.query_pairs_mut()
            .append_pair("connect_session_token", session_token);
        Ok(url.to_string())
    }

    /// Fetches the current access material for a provider connection.
    /// Returns `None` when the vault holds nothing for it.
    pub async fn get_access_material(
        &self,
        provider: &str,
        external_connection_id: &str,
    ) -> Result<Option<AccessMaterial>, VaultError> {
        self.fetch_access_material(provider, external_connection_id, false)
            .await
    }

    /// Forces a refresh of the access material at the vault.
    pub async fn refresh_access_material(
        &self,
        provider: &str,
        external_connection_id: &str,
    ) -> Result<Option<AccessMaterial>, VaultError> {
        self.fetch_access_material(provider, external_connection_id, true)
            .await
    }

    async fn fetch_access_material(
        &self,
        provider: &str,
        external_connection_id: &str,
        force_refresh: bool,
    ) -> Result<Option<AccessMaterial>, VaultError> {
        let response = self
            .http
            .get(format!(
                "{}/connection/{}",
                self.api_url, external_connection_id
            ))
            .query(&[
                ("provider_config_key", provider),
                ("force_refresh", if force_refresh { "true" } else { "false" }),
            ])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(VaultError::UnexpectedStatus {
                operation: "get_access_material",
                status: response.status(),
            });
        }

        let envelope: ConnectionEnvelope = response.json().await.map_err(VaultError::Decode)?;
        Ok(Some(envelope.credentials))
    }

    /// Deletes the provider-side connection. Returns whether the vault
    /// confirmed the teardown.
    pub async fn delete_connection(
        &self,
        provider: &str,
        external_connection_id: &str,
    ) -> Result<bool, VaultError> {
        let response = self
            .http
            .delete(format!(
                "{}/connection/{}",
                self.api_url, external_connection_id
            ))
            .query(&[("provider_config_key", provider)])
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => {
                // Already gone provider-side; treat as confirmed.
                debug!(external_connection_id, "Vault connection already deleted");
                Ok(true)
            }
            status => Err(VaultError::UnexpectedStatus {
                operation: "delete_connection",
                status,
            }),
        }
    }

    /// Verifies the vault webhook signature (HMAC-SHA256 hex over the raw
    /// body) with a constant-time comparison.
    pub fn verify_webhook_signature(&self, signature_header: &str, body: &[u8]) -> bool {
        let Some(secret) = self.webhook_secret.as_deref() else {
            return false;
        };

        let Ok(provided) = hex::decode(signature_header.trim()) else {
            return false;
        };

        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(body);
        let expected = mac.finalize().into_bytes();

        expected.as_slice().ct_eq(&provided[..]).into()
    }

    /// Whether webhook verification is configured at all.
    pub fn webhook_verification_enabled(&self) -> bool {
        self.webhook_secret.is_some()
    }
}

/// Computes the hex signature the vault would attach to a payload. Test
/// helper for webhook handlers.
pub fn sign_webhook_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Extracts a vendor metadata block from a stored provider account snapshot,
/// guaranteeing the `accountId` and `displayName` keys are present.
pub fn vendor_block(provider_account: Option<&JsonValue>) -> JsonValue {
    let mut vendor = json!({
        "accountId": JsonValue::Null,
        "displayName": JsonValue::Null,
    });

    if let Some(JsonValue::Object(account)) = provider_account {
        let block = vendor.as_object_mut().expect("vendor is an object");
        if let Some(account_id) = account.get("account_id") {
            block.insert("accountId".to_string(), account_id.clone());
        }
        if let Some(display_name) = account.get("display_name") {
            block.insert("displayName".to_string(), display_name.clone());
        }
        for (key, value) in account {
            block.insert(key.clone(), value.clone());
        }
    }

    vendor
}
