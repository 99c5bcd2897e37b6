//! Integration tests for the tenant-scoped connections API.

mod test_utils;

use anyhow::Result;
use sea_orm::EntityTrait;
use serde_json::{Value, json};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use connection_broker::models::connection;
use test_utils::{ConnectionSeed, insert_connection, setup_test_db, start_test_server};

async fn mount_session_endpoint(mock: &MockServer, endpoint: &str, token: &str) {
    Mock::given(method("POST"))
        .and(path(endpoint))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({"data": {"token": token}})),
        )
        .mount(mock)
        .await;
}

#[tokio::test]
async fn create_connection_returns_authorization_url() -> Result<()> {
    let mock = MockServer::start().await;
    mount_session_endpoint(&mock, "/connect/sessions", "sess-123").await;

    let db = setup_test_db().await?;
    let base_url = start_test_server(db.clone(), &mock.uri()).await;
    let tenant_id = Uuid::new_v4();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base_url}/v1/tenants/{tenant_id}/connections"))
        .json(&json!({"sub": "user-1", "provider": "github", "scopes": ["Repo"]}))
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await?;
    let authorization_url = body["authorization_url"].as_str().unwrap();
    assert!(authorization_url.contains("/oauth/connect/github"));
    assert!(authorization_url.contains("connect_session_token=sess-123"));

    let connection_id = Uuid::parse_str(body["connection_id"].as_str().unwrap())?;
    let stored = connection::Entity::find_by_id(connection_id)
        .one(&db)
        .await?
        .unwrap();
    assert_eq!(stored.status, "pending");
    assert_eq!(stored.tenant_id, tenant_id);
    // Requested scopes are normalized to lowercase before storage.
    assert_eq!(stored.authorized_scopes, Some(json!(["repo"])));

    Ok(())
}

#[tokio::test]
async fn create_reuses_existing_pending_connection() -> Result<()> {
    let mock = MockServer::start().await;
    mount_session_endpoint(&mock, "/connect/sessions", "sess-123").await;

    let db = setup_test_db().await?;
    let base_url = start_test_server(db, &mock.uri()).await;
    let tenant_id = Uuid::new_v4();

    let client = reqwest::Client::new();
    let request = json!({"sub": "user-1", "provider": "github", "scopes": ["repo"]});

    let first: Value = client
        .post(format!("{base_url}/v1/tenants/{tenant_id}/connections"))
        .json(&request)
        .send()
        .await?
        .json()
        .await?;
    let second: Value = client
        .post(format!("{base_url}/v1/tenants/{tenant_id}/connections"))
        .json(&request)
        .send()
        .await?
        .json()
        .await?;

    assert_eq!(first["connection_id"], second["connection_id"]);

    Ok(())
}

#[tokio::test]
async fn create_rejects_duplicate_active_connection() -> Result<()> {
    let mock = MockServer::start().await;
    let db = setup_test_db().await?;
    let seeded = insert_connection(&db, ConnectionSeed::default()).await?;
    let base_url = start_test_server(db, &mock.uri()).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!(
            "{base_url}/v1/tenants/{}/connections",
            seeded.tenant_id
        ))
        .json(&json!({"sub": "user-1", "provider": "github", "scopes": ["repo"]}))
        .send()
        .await?;

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await?;
    assert_eq!(body["code"], "ALREADY_CONNECTED");

    Ok(())
}

#[tokio::test]
async fn list_connections_filters_by_subject() -> Result<()> {
    let mock = MockServer::start().await;
    let db = setup_test_db().await?;
    let tenant_id = Uuid::new_v4();
    insert_connection(
        &db,
        ConnectionSeed {
            tenant_id,
            sub: "alice".to_string(),
            ..Default::default()
        },
    )
    .await?;
    insert_connection(
        &db,
        ConnectionSeed {
            tenant_id,
            sub: "bob".to_string(),
            provider: "gitlab".to_string(),
            external_connection_id: Some("ext-2".to_string()),
            ..Default::default()
        },
    )
    .await?;
    let base_url = start_test_server(db, &mock.uri()).await;

    let client = reqwest::Client::new();
    let all: Value = client
        .get(format!("{base_url}/v1/tenants/{tenant_id}/connections"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(all["count"], 2);

    let filtered: Value = client
        .get(format!(
            "{base_url}/v1/tenants/{tenant_id}/connections?user=alice"
        ))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(filtered["count"], 1);
    assert_eq!(filtered["connections"][0]["sub"], "alice");

    Ok(())
}

#[tokio::test]
async fn list_responses_omit_confidential_fields() -> Result<()> {
    let mock = MockServer::start().await;
    let db = setup_test_db().await?;
    let seeded = insert_connection(&db, ConnectionSeed::default()).await?;
    let base_url = start_test_server(db, &mock.uri()).await;

    let body: Value = reqwest::Client::new()
        .get(format!(
            "{base_url}/v1/tenants/{}/connections",
            seeded.tenant_id
        ))
        .send()
        .await?
        .json()
        .await?;

    let entry = &body["connections"][0];
    assert_eq!(entry["status"], "active");
    assert!(entry.get("external_connection_id").is_none());
    assert!(entry.get("provider_account").is_none());
    assert!(entry.get("connection_version").is_none());

    Ok(())
}

#[tokio::test]
async fn get_connection_is_scoped_to_its_tenant() -> Result<()> {
    let mock = MockServer::start().await;
    let db = setup_test_db().await?;
    let seeded = insert_connection(&db, ConnectionSeed::default()).await?;
    let base_url = start_test_server(db, &mock.uri()).await;

    let client = reqwest::Client::new();
    let owned = client
        .get(format!(
            "{base_url}/v1/tenants/{}/connections/{}",
            seeded.tenant_id, seeded.id
        ))
        .send()
        .await?;
    assert_eq!(owned.status(), 200);

    let foreign = client
        .get(format!(
            "{base_url}/v1/tenants/{}/connections/{}",
            Uuid::new_v4(),
            seeded.id
        ))
        .send()
        .await?;
    assert_eq!(foreign.status(), 404);

    Ok(())
}

#[tokio::test]
async fn update_connection_opens_reconnect_session() -> Result<()> {
    let mock = MockServer::start().await;
    mount_session_endpoint(&mock, "/connect/sessions/reconnect", "sess-re").await;

    let db = setup_test_db().await?;
    let seeded = insert_connection(&db, ConnectionSeed::default()).await?;
    let base_url = start_test_server(db, &mock.uri()).await;

    let response = reqwest::Client::new()
        .put(format!(
            "{base_url}/v1/tenants/{}/connections/{}",
            seeded.tenant_id, seeded.id
        ))
        .json(&json!({"sub": "user-1", "provider": "github", "scopes": ["repo", "gist"]}))
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await?;
    assert!(
        body["authorization_url"]
            .as_str()
            .unwrap()
            .contains("connect_session_token=sess-re")
    );

    Ok(())
}

#[tokio::test]
async fn update_rejects_connection_without_provider_counterpart() -> Result<()> {
    let mock = MockServer::start().await;
    let db = setup_test_db().await?;
    let seeded = insert_connection(
        &db,
        ConnectionSeed {
            status: "pending".to_string(),
            external_connection_id: None,
            ..Default::default()
        },
    )
    .await?;
    let base_url = start_test_server(db, &mock.uri()).await;

    let response = reqwest::Client::new()
        .put(format!(
            "{base_url}/v1/tenants/{}/connections/{}",
            seeded.tenant_id, seeded.id
        ))
        .json(&json!({"sub": "user-1", "provider": "github", "scopes": ["repo"]}))
        .send()
        .await?;

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await?;
    assert_eq!(body["code"], "INVALID_STATE");

    Ok(())
}

#[tokio::test]
async fn delete_revokes_after_vault_confirms_teardown() -> Result<()> {
    let mock = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/connection/ext-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&mock)
        .await;

    let db = setup_test_db().await?;
    let seeded = insert_connection(&db, ConnectionSeed::default()).await?;
    let base_url = start_test_server(db.clone(), &mock.uri()).await;

    let response = reqwest::Client::new()
        .delete(format!(
            "{base_url}/v1/tenants/{}/connections/{}",
            seeded.tenant_id, seeded.id
        ))
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await?;
    assert_eq!(body["deleted"], true);

    let stored = connection::Entity::find_by_id(seeded.id)
        .one(&db)
        .await?
        .unwrap();
    assert_eq!(stored.status, "revoked");
    assert!(stored.revoked_at.is_some());

    Ok(())
}

#[tokio::test]
async fn delete_treats_missing_vault_connection_as_confirmed() -> Result<()> {
    let mock = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/connection/ext-1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock)
        .await;

    let db = setup_test_db().await?;
    let seeded = insert_connection(&db, ConnectionSeed::default()).await?;
    let base_url = start_test_server(db.clone(), &mock.uri()).await;

    let response = reqwest::Client::new()
        .delete(format!(
            "{base_url}/v1/tenants/{}/connections/{}",
            seeded.tenant_id, seeded.id
        ))
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    let stored = connection::Entity::find_by_id(seeded.id)
        .one(&db)
        .await?
        .unwrap();
    assert_eq!(stored.status, "revoked");

    Ok(())
}

#[tokio::test]
async fn delete_pending_connection_skips_vault_teardown() -> Result<()> {
    let mock = MockServer::start().await;
    let db = setup_test_db().await?;
    let seeded = insert_connection(
        &db,
        ConnectionSeed {
            status: "pending".to_string(),
            external_connection_id: None,
            ..Default::default()
        },
    )
    .await?;
    let base_url = start_test_server(db.clone(), &mock.uri()).await;

    let response = reqwest::Client::new()
        .delete(format!(
            "{base_url}/v1/tenants/{}/connections/{}",
            seeded.tenant_id, seeded.id
        ))
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    let stored = connection::Entity::find_by_id(seeded.id)
        .one(&db)
        .await?
        .unwrap();
    assert_eq!(stored.status, "revoked");

    Ok(())
}

#[tokio::test]
async fn delete_is_idempotent_for_revoked_connections() -> Result<()> {
    let mock = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/connection/ext-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&mock)
        .await;

    let db = setup_test_db().await?;
    let seeded = insert_connection(&db, ConnectionSeed::default()).await?;
    let base_url = start_test_server(db.clone(), &mock.uri()).await;
    let url = format!(
        "{base_url}/v1/tenants/{}/connections/{}",
        seeded.tenant_id, seeded.id
    );

    let client = reqwest::Client::new();
    let first = client.delete(&url).send().await?;
    assert_eq!(first.status(), 200);
    let after_first = connection::Entity::find_by_id(seeded.id)
        .one(&db)
        .await?
        .unwrap();
    let first_revoked_at = after_first.revoked_at.unwrap();

    let second = client.delete(&url).send().await?;
    assert_eq!(second.status(), 200);
    let body: Value = second.json().await?;
    assert_eq!(body["deleted"], true);

    let after_second = connection::Entity::find_by_id(seeded.id)
        .one(&db)
        .await?
        .unwrap();
    assert_eq!(after_second.status, "revoked");
    // The second revocation leaves the original timestamp untouched.
    assert_eq!(after_second.revoked_at, Some(first_revoked_at));

    Ok(())
}

#[tokio::test]
async fn storage_rejects_second_live_row_for_same_triple() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant_id = Uuid::new_v4();

    insert_connection(
        &db,
        ConnectionSeed {
            tenant_id,
            status: "pending".to_string(),
            external_connection_id: None,
            ..Default::default()
        },
    )
    .await?;

    // The unique index over live rows rejects the duplicate even when the
    // application-level check is bypassed.
    let duplicate = insert_connection(
        &db,
        ConnectionSeed {
            tenant_id,
            status: "pending".to_string(),
            external_connection_id: None,
            ..Default::default()
        },
    )
    .await;
    assert!(duplicate.is_err());

    Ok(())
}

#[tokio::test]
async fn revoked_rows_do_not_block_new_connections() -> Result<()> {
    let db = setup_test_db().await?;
    let tenant_id = Uuid::new_v4();

    insert_connection(
        &db,
        ConnectionSeed {
            tenant_id,
            status: "revoked".to_string(),
            external_connection_id: Some("ext-old".to_string()),
            ..Default::default()
        },
    )
    .await?;

    let replacement = insert_connection(
        &db,
        ConnectionSeed {
            tenant_id,
            status: "pending".to_string(),
            external_connection_id: None,
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(replacement.status, "pending");

    Ok(())
}

#[tokio::test]
async fn delete_fails_when_vault_teardown_fails() -> Result<()> {
    let mock = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/connection/ext-1"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock)
        .await;

    let db = setup_test_db().await?;
    let seeded = insert_connection(&db, ConnectionSeed::default()).await?;
    let base_url = start_test_server(db.clone(), &mock.uri()).await;

    let response = reqwest::Client::new()
        .delete(format!(
            "{base_url}/v1/tenants/{}/connections/{}",
            seeded.tenant_id, seeded.id
        ))
        .send()
        .await?;

    assert_eq!(response.status(), 502);

    // The row stays live until the vault confirms.
    let stored = connection::Entity::find_by_id(seeded.id)
        .one(&db)
        .await?
        .unwrap();
    assert_eq!(stored.status, "active");

    Ok(())
}
