//! Server bootstrap smoke tests: service info endpoint and OpenAPI document.

mod test_utils;

use anyhow::Result;
use serde_json::Value;
use wiremock::MockServer;

use test_utils::{setup_test_db, start_test_server};

#[tokio::test]
async fn root_reports_service_info() -> Result<()> {
    let mock = MockServer::start().await;
    let db = setup_test_db().await?;
    let base_url = start_test_server(db, &mock.uri()).await;

    let body: Value = reqwest::Client::new()
        .get(format!("{base_url}/"))
        .send()
        .await?
        .json()
        .await?;

    assert_eq!(body["service"], "connection-broker");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

    Ok(())
}

#[tokio::test]
async fn openapi_document_lists_api_paths() -> Result<()> {
    let mock = MockServer::start().await;
    let db = setup_test_db().await?;
    let base_url = start_test_server(db, &mock.uri()).await;

    let response = reqwest::Client::new()
        .get(format!("{base_url}/openapi.json"))
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    let document: Value = response.json().await?;
    assert_eq!(document["info"]["title"], "Connection Broker API");

    let paths = document["paths"].as_object().unwrap();
    assert!(paths.contains_key("/v1/tenants/{tenant_id}/connections"));
    assert!(paths.contains_key("/v1/tenants/{tenant_id}/connections/{connection_id}/token"));
    assert!(paths.contains_key("/v1/webhooks/vault"));

    Ok(())
}

#[tokio::test]
async fn health_endpoint_reports_ok() -> Result<()> {
    let mock = MockServer::start().await;
    let db = setup_test_db().await?;
    let base_url = start_test_server(db, &mock.uri()).await;

    let response = reqwest::Client::new()
        .get(format!("{base_url}/health"))
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await?;
    assert_eq!(body["status"], "ok");

    Ok(())
}

#[tokio::test]
async fn error_responses_echo_the_request_id() -> Result<()> {
    let mock = MockServer::start().await;
    let db = setup_test_db().await?;
    let base_url = start_test_server(db, &mock.uri()).await;

    let tenant_id = uuid::Uuid::new_v4();
    let connection_id = uuid::Uuid::new_v4();
    let response = reqwest::Client::new()
        .get(format!(
            "{base_url}/v1/tenants/{tenant_id}/connections/{connection_id}"
        ))
        .header("x-request-id", "req-42")
        .send()
        .await?;

    assert_eq!(response.status(), 404);
    let body: Value = response.json().await?;
    assert_eq!(body["trace_id"], "req-42");

    Ok(())
}

#[tokio::test]
async fn unknown_route_returns_404() -> Result<()> {
    let mock = MockServer::start().await;
    let db = setup_test_db().await?;
    let base_url = start_test_server(db, &mock.uri()).await;

    let response = reqwest::Client::new()
        .get(format!("{base_url}/v1/nope"))
        .send()
        .await?;
    assert_eq!(response.status(), 404);

    Ok(())
}
