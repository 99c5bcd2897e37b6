//! # Server Configuration
//!
//! This module contains the server setup and configuration for the
//! connection broker API.

use axum::{
    Router,
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::delegation::DelegationTokenValidator;
use crate::handlers;
use crate::issuance::AccessIssuer;
use crate::replay::ReplayGuard;
use crate::repositories::ConnectionRepository;
use crate::telemetry::{self, TraceContext};
use crate::vault::{VaultClient, VaultError};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub vault: Arc<VaultClient>,
    pub repository: ConnectionRepository,
    pub issuer: Arc<AccessIssuer>,
}

impl AppState {
    /// Wires the shared components from configuration and a database pool.
    pub fn new(config: AppConfig, db: DatabaseConnection) -> Result<Self, VaultError> {
        let config = Arc::new(config);
        let vault = Arc::new(VaultClient::from_config(&config.vault)?);
        let validator = Arc::new(DelegationTokenValidator::from_config(&config.delegation));
        let replay = Arc::new(ReplayGuard::new(config.issuance.replay_cache_capacity));
        let repository = ConnectionRepository::new(Arc::new(db.clone()));
        let issuer = Arc::new(AccessIssuer::new(
            repository.clone(),
            vault.clone(),
            validator,
            replay,
            config.issuance.default_access_lifetime_seconds,
        ));

        Ok(Self {
            config,
            db,
            vault,
            repository,
            issuer,
        })
    }
}

/// Makes a trace ID available to every handler and error response. Honors a
/// caller-supplied `x-request-id`, otherwise generates one.
async fn trace_context_middleware(request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    telemetry::with_trace_context(TraceContext { trace_id }, next.run(request)).await
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route(
            "/v1/tenants/{tenant_id}/connections",
            post(handlers::connections::create_connection)
                .get(handlers::connections::list_connections),
        )
        .route(
            "/v1/tenants/{tenant_id}/connections/{connection_id}",
            get(handlers::connections::get_connection)
                .put(handlers::connections::update_connection)
                .delete(handlers::connections::delete_connection),
        )
        .route(
            "/v1/tenants/{tenant_id}/connections/{connection_id}/token",
            post(handlers::tokens::issue_access_token),
        )
        .route("/v1/webhooks/vault", post(handlers::webhooks::vault_webhook))
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Starts the server with the given configuration
pub async fn run_server(
    config: AppConfig,
    db: DatabaseConnection,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;
    let profile = config.profile.clone();

    let state = AppState::new(config, db)?;
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, %profile, "Server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::health,
        crate::handlers::connections::create_connection,
        crate::handlers::connections::list_connections,
        crate::handlers::connections::get_connection,
        crate::handlers::connections::update_connection,
        crate::handlers::connections::delete_connection,
        crate::handlers::tokens::issue_access_token,
        crate::handlers::webhooks::vault_webhook,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthResponse,
            crate::error::ApiError,
            crate::lifecycle::ConnectionStatus,
            crate::issuance::AccessArtifact,
            crate::handlers::connections::CreateConnectionRequest,
            crate::handlers::connections::CreateConnectionResponse,
            crate::handlers::connections::UpdateConnectionRequest,
            crate::handlers::connections::UpdateConnectionResponse,
            crate::handlers::connections::ConnectionInfo,
            crate::handlers::connections::ConnectionsResponse,
            crate::handlers::connections::DeleteConnectionResponse,
            crate::handlers::tokens::IssueTokenRequest,
            crate::handlers::webhooks::WebhookAck,
        )
    ),
    info(
        title = "Connection Broker API",
        description = "Multi-tenant broker for short-lived provider access credentials",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
