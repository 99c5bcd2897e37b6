//! Test utilities for database and server testing.
//!
//! Provides in-memory SQLite databases with migrations applied, connection
//! row fixtures, delegation-token minting, and a server bootstrap pointed at
//! a mock vault.

use anyhow::Result;
use chrono::Utc;
use connection_broker::config::{AppConfig, DelegationConfig, VaultConfig};
use connection_broker::migration::{Migrator, MigratorTrait};
use connection_broker::models::connection;
use connection_broker::server::{AppState, create_app};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{ActiveModelTrait, Database, DatabaseConnection, Set};
use serde_json::{Value, json};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use uuid::Uuid;

pub const TEST_DELEGATION_SECRET: &str = "test-delegation-secret";
pub const TEST_WEBHOOK_SECRET: &str = "test-webhook-secret";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Test configuration pointed at a mock vault server.
pub fn test_config(vault_uri: &str) -> AppConfig {
    AppConfig {
        profile: "test".to_string(),
        delegation: DelegationConfig {
            secret: Some(TEST_DELEGATION_SECRET.to_string()),
            ..Default::default()
        },
        vault: VaultConfig {
            api_url: vault_uri.to_string(),
            auth_url: format!("{}/oauth/connect", vault_uri),
            secret_key: Some("test-vault-key".to_string()),
            webhook_secret: Some(TEST_WEBHOOK_SECRET.to_string()),
            timeout_ms: 5000,
        },
        ..Default::default()
    }
}

/// Starts the server on a random port against the given database and mock
/// vault, returning its base URL.
pub async fn start_test_server(db: DatabaseConnection, vault_uri: &str) -> String {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let state = AppState::new(test_config(vault_uri), db).expect("failed to build app state");
    let app = create_app(state);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", addr)
}

/// Fields for seeding a connection row. Defaults describe an active GitHub
/// connection authorized for `repo`.
pub struct ConnectionSeed {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub sub: String,
    pub provider: String,
    pub status: String,
    pub external_connection_id: Option<String>,
    pub scopes: Vec<String>,
    pub connection_version: i32,
    pub provider_account: Option<Value>,
}

impl Default for ConnectionSeed {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            sub: "user-1".to_string(),
            provider: "github".to_string(),
            status: "active".to_string(),
            external_connection_id: Some("ext-1".to_string()),
            scopes: vec!["repo".to_string()],
            connection_version: 1,
            provider_account: Some(json!({"account_id": "acct-1", "display_name": "Octo Cat"})),
        }
    }
}

/// Inserts a connection row for testing.
pub async fn insert_connection(
    db: &DatabaseConnection,
    seed: ConnectionSeed,
) -> Result<connection::Model> {
    let now: DateTimeWithTimeZone = Utc::now().into();
    let active = connection::ActiveModel {
        id: Set(seed.id),
        tenant_id: Set(seed.tenant_id),
        sub: Set(seed.sub),
        provider: Set(seed.provider),
        external_connection_id: Set(seed.external_connection_id),
        status: Set(seed.status),
        connection_version: Set(seed.connection_version),
        authorized_scopes: Set(Some(json!(seed.scopes))),
        auth_mode: Set(Some("oauth".to_string())),
        provider_account: Set(seed.provider_account),
        last_accessed_at: Set(None),
        revoked_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    };

    Ok(active.insert(db).await?)
}

/// Builds a complete, valid delegation claim set bound to the given
/// identifiers, expiring ten minutes out. Tests mutate the returned value to
/// produce invalid variants.
pub fn delegation_claims(
    tenant_id: Uuid,
    connection_id: Uuid,
    sub: &str,
    scopes: &[&str],
) -> Value {
    json!({
        "aud": "connections-service",
        "azp": "taoflow-backend",
        "iss": "wuwei-backend",
        "exp": Utc::now().timestamp() + 600,
        "jti": Uuid::new_v4().to_string(),
        "tid": tenant_id.to_string(),
        "cid": connection_id.to_string(),
        "sub": sub,
        "scp": scopes,
    })
}

/// Signs claims with the test delegation secret.
pub fn sign_delegation(claims: &Value) -> String {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(TEST_DELEGATION_SECRET.as_bytes()),
    )
    .unwrap()
}
