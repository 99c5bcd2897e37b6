//! Delegation token validation.
//!
//! Delegation tokens are compact HS256 JWTs minted by the trusted upstream
//! backend. Validation verifies the signature against an algorithm allow-list,
//! requires every mandatory claim explicitly (absence is a rejection, never a
//! default), pins the fixed service identities (`aud`, `azp`, `iss`), and
//! binds the token to the tenant and connection addressed by the request
//! path so a token cannot be replayed against a different resource.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::config::DelegationConfig;
use crate::error::IssuanceError;
use crate::scopes::normalize_scopes;

/// Signing secret used when no delegation secret is configured. Only
/// reachable in the local and test profiles; config validation rejects a
/// missing secret everywhere else.
const LOCAL_DEV_SECRET: &str = "insecure-local-delegation-secret";

/// Raw claim payload as decoded from the token, before any presence checks.
///
/// Every field is optional here so that a missing claim surfaces as a
/// `ClaimMismatch` naming the claim instead of an opaque decode failure.
#[derive(Debug, Deserialize)]
struct RawClaims {
    aud: Option<String>,
    azp: Option<String>,
    iss: Option<String>,
    exp: Option<i64>,
    jti: Option<String>,
    tid: Option<String>,
    cid: Option<String>,
    sub: Option<String>,
    scp: Option<JsonValue>,
    cver: Option<i64>,
}

/// Claims of a fully validated delegation token, bound to the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedDelegation {
    pub tenant_id: Uuid,
    pub connection_id: Uuid,
    pub subject: String,
    /// Requested scopes, normalized to lowercase.
    pub scopes: Vec<String>,
    pub jti: String,
    /// Expiry as Unix seconds.
    pub exp: i64,
    /// Optional authorization-version snapshot.
    pub connection_version: Option<i64>,
}

/// Verifies delegation tokens against the configured signing secret and the
/// fixed upstream identities.
pub struct DelegationTokenValidator {
    decoding_key: DecodingKey,
    validation: Validation,
    audience: String,
    authorized_party: String,
    issuer: String,
}

impl DelegationTokenValidator {
    pub fn from_config(config: &DelegationConfig) -> Self {
        let secret = match config.secret.as_deref() {
            Some(secret) => secret,
            None => {
                tracing::warn!(
                    "No delegation secret configured, using the insecure local development secret"
                );
                LOCAL_DEV_SECRET
            }
        };

        // Presence and expiry are checked manually so failures name the claim.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            audience: config.audience.clone(),
            authorized_party: config.authorized_party.clone(),
            issuer: config.issuer.clone(),
        }
    }

    /// Validates a delegation token against the tenant and connection
    /// addressed by the request path.
    pub fn validate(
        &self,
        token: &str,
        path_tenant_id: Uuid,
        path_connection_id: Uuid,
    ) -> Result<ValidatedDelegation, IssuanceError> {
        self.validate_at(token, path_tenant_id, path_connection_id, Utc::now().timestamp())
    }

    fn validate_at(
        &self,
        token: &str,
        path_tenant_id: Uuid,
        path_connection_id: Uuid,
        now: i64,
    ) -> Result<ValidatedDelegation, IssuanceError> {
        let claims = decode::<RawClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => IssuanceError::ExpiredToken,
                _ => IssuanceError::InvalidToken,
            })?
            .claims;

        // Expiry comes first so an expired token reports as expired even
        // when other claims are missing or wrong.
        let exp = required(claims.exp, "exp")?;
        if now >= exp {
            return Err(IssuanceError::ExpiredToken);
        }

        let aud = required(claims.aud, "aud")?;
        let azp = required(claims.azp, "azp")?;
        let iss = required(claims.iss, "iss")?;
        let jti = required(claims.jti, "jti")?;
        let tid = required(claims.tid, "tid")?;
        let cid = required(claims.cid, "cid")?;
        let subject = required(claims.sub, "sub")?;
        let scp = required(claims.scp, "scp")?;

        if aud != self.audience {
            return Err(IssuanceError::ClaimMismatch(
                "Token audience does not match this service".to_string(),
            ));
        }
        if azp != self.authorized_party {
            return Err(IssuanceError::ClaimMismatch(
                "Token authorized party is not trusted".to_string(),
            ));
        }
        if iss != self.issuer {
            return Err(IssuanceError::ClaimMismatch(
                "Token issuer is not trusted".to_string(),
            ));
        }

        let tenant_id = parse_uuid_claim(&tid)?;
        if tenant_id != path_tenant_id {
            return Err(IssuanceError::ClaimMismatch(
                "Token tenant does not match request path".to_string(),
            ));
        }

        let connection_id = parse_uuid_claim(&cid)?;
        if connection_id != path_connection_id {
            return Err(IssuanceError::ClaimMismatch(
                "Token connection does not match request path".to_string(),
            ));
        }

        let scopes = scope_list(&scp)?;

        Ok(ValidatedDelegation {
            tenant_id,
            connection_id,
            subject,
            scopes,
            jti,
            exp,
            connection_version: claims.cver,
        })
    }
}

fn required<T>(claim: Option<T>, name: &str) -> Result<T, IssuanceError> {
    claim.ok_or_else(|| IssuanceError::ClaimMismatch(format!("Missing required claim: {name}")))
}

fn parse_uuid_claim(value: &str) -> Result<Uuid, IssuanceError> {
    Uuid::parse_str(value).map_err(|_| {
        IssuanceError::ClaimMismatch("Token resource identifier is malformed".to_string())
    })
}

fn scope_list(scp: &JsonValue) -> Result<Vec<String>, IssuanceError> {
    let entries = scp.as_array().ok_or_else(|| {
        IssuanceError::ClaimMismatch("scp claim must be a list of scopes".to_string())
    })?;

    let mut scopes = Vec::with_capacity(entries.len());
    for entry in entries {
        let scope = entry.as_str().ok_or_else(|| {
            IssuanceError::ClaimMismatch("scp claim must be a list of scopes".to_string())
        })?;
        scopes.push(scope);
    }

    Ok(normalize_scopes(scopes))
}
