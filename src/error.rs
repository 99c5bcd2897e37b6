//! # Error Handling
//!
//! This module provides unified error handling for the connection broker,
//! implementing a consistent problem+json response format with trace ID
//! propagation, plus the issuance-flow error taxonomy.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;

use crate::telemetry;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Extract current trace ID from the active tracing span (falls back to generated correlation ID)
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                // Fallback: generate a correlation ID for basic client-server log correlation
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        (self.status, headers, axum::Json(self)).into_response()
    }
}

/// Failure taxonomy for the delegation-validation and access-issuance flow.
///
/// Each variant maps to exactly one HTTP status; internal detail from the
/// vault or the database is never forwarded to the caller.
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("Connection not found")]
    NotFound,
    #[error("Access token not available")]
    AccessMaterialUnavailable,
    #[error("User already has a connection with this provider")]
    AlreadyConnected,
    #[error("{0}")]
    Forbidden(String),
    #[error("Connection is not active")]
    InvalidState { status: String },
    #[error("Connection version mismatch")]
    VersionConflict,
    #[error("Token scopes not authorized for connection: {}", scopes.join(", "))]
    ScopeViolation { scopes: Vec<String> },
    #[error("Invalid delegation token")]
    InvalidToken,
    #[error("Delegation token has expired")]
    ExpiredToken,
    #[error("{0}")]
    ClaimMismatch(String),
    #[error("Delegation token has already been used")]
    TokenReplayed,
    #[error("{service} service error")]
    ExternalService {
        service: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("{service} request timed out")]
    ExternalTimeout { service: &'static str },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IssuanceError {
    /// Error code string for programmatic handling (SCREAMING_SNAKE_CASE)
    pub fn error_code(&self) -> &'static str {
        match self {
            IssuanceError::NotFound | IssuanceError::AccessMaterialUnavailable => "NOT_FOUND",
            IssuanceError::AlreadyConnected => "ALREADY_CONNECTED",
            IssuanceError::Forbidden(_) => "FORBIDDEN",
            IssuanceError::InvalidState { .. } => "INVALID_STATE",
            IssuanceError::VersionConflict => "VERSION_CONFLICT",
            IssuanceError::ScopeViolation { .. } => "SCOPE_VIOLATION",
            IssuanceError::InvalidToken => "INVALID_TOKEN",
            IssuanceError::ExpiredToken => "EXPIRED_TOKEN",
            IssuanceError::ClaimMismatch(_) => "CLAIM_MISMATCH",
            IssuanceError::TokenReplayed => "TOKEN_REPLAYED",
            IssuanceError::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            IssuanceError::ExternalTimeout { .. } => "EXTERNAL_SERVICE_TIMEOUT",
            IssuanceError::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// HTTP status for this failure
    pub fn status_code(&self) -> StatusCode {
        match self {
            IssuanceError::NotFound | IssuanceError::AccessMaterialUnavailable => {
                StatusCode::NOT_FOUND
            }
            IssuanceError::Forbidden(_) | IssuanceError::ScopeViolation { .. } => {
                StatusCode::FORBIDDEN
            }
            IssuanceError::AlreadyConnected
            | IssuanceError::InvalidState { .. }
            | IssuanceError::VersionConflict => StatusCode::BAD_REQUEST,
            IssuanceError::InvalidToken
            | IssuanceError::ExpiredToken
            | IssuanceError::ClaimMismatch(_)
            | IssuanceError::TokenReplayed => StatusCode::UNAUTHORIZED,
            IssuanceError::ExternalService { .. } => StatusCode::BAD_GATEWAY,
            IssuanceError::ExternalTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            IssuanceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<IssuanceError> for ApiError {
    fn from(error: IssuanceError) -> Self {
        let status = error.status_code();
        let code = error.error_code();

        match error {
            IssuanceError::InvalidState { status: current } => {
                ApiError::new(StatusCode::BAD_REQUEST, code, "Connection is not active")
                    .with_details(json!({ "status": current }))
            }
            IssuanceError::ScopeViolation { ref scopes } => {
                ApiError::new(status, code, &error.to_string())
                    .with_details(json!({ "unauthorized_scopes": scopes }))
            }
            IssuanceError::ExternalService { source, .. } => {
                // Log the upstream detail; the caller only sees a generic message
                tracing::error!(error = ?source, "External service error");
                ApiError::new(status, code, "External service error")
            }
            IssuanceError::ExternalTimeout { service } => {
                tracing::error!(service, "External service timeout");
                ApiError::new(status, code, "External service timeout")
            }
            IssuanceError::Internal(source) => {
                tracing::error!(error = ?source, "Internal error during issuance");
                ApiError::new(status, code, "An internal error occurred")
            }
            other => ApiError::new(status, code, &other.to_string()),
        }
    }
}

// Error mappers for common sources

impl From<sea_orm::DbErr> for IssuanceError {
    fn from(error: sea_orm::DbErr) -> Self {
        IssuanceError::Internal(anyhow::Error::new(error))
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        // Log the full error for debugging
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}
