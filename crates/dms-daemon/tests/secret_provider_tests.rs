//! Integration tests for the secret store client
//!
//! Uses wiremock to stand in for the secret store: one endpoint for the
//! secret metadata, one for the payload.

use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use dms_core::ports::ISecretProvider;
use dms_daemon::secrets::HttpSecretProvider;

const TOKEN: &str = "gAAAAAB-test-token";

async fn mock_secret_store(payload: ResponseTemplate) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/secrets/abc"))
        .and(header("X-Auth-Token", TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "s3-backup-credentials",
            "content_types": { "default": "application/json" }
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/secrets/abc/payload"))
        .and(header("X-Auth-Token", TOKEN))
        .respond_with(payload)
        .mount(&server)
        .await;

    server
}

#[tokio::test]
async fn fetch_resolves_credentials() {
    let server = mock_secret_store(ResponseTemplate::new(200).set_body_json(json!({
        "access_key": "AKIAEXAMPLE",
        "secret_key": "very-secret",
        "bucket": "backups",
        "region": "us-west-2",
        "endpoint_url": "https://s3.example:9000",
        "ssl": true,
        "ssl_verify": false,
        "max_pool_connections": 500
    })))
    .await;

    let provider = HttpSecretProvider::new();
    let secret_ref = format!("{}/v1/secrets/abc", server.uri());

    let creds = provider.fetch(&secret_ref, TOKEN).await.unwrap();
    assert_eq!(creds.access_key, "AKIAEXAMPLE");
    assert_eq!(creds.secret_key, "very-secret");
    assert_eq!(creds.bucket.as_deref(), Some("backups"));
    assert!(!creds.ssl_verify);
    assert_eq!(creds.extra["max_pool_connections"], 500);
}

#[tokio::test]
async fn fetch_accepts_aws_style_key_names() {
    let server = mock_secret_store(ResponseTemplate::new(200).set_body_json(json!({
        "aws_access_key_id": "AKIAALIAS",
        "aws_secret_access_key": "alias-secret"
    })))
    .await;

    let provider = HttpSecretProvider::new();
    let secret_ref = format!("{}/v1/secrets/abc", server.uri());

    let creds = provider.fetch(&secret_ref, TOKEN).await.unwrap();
    assert_eq!(creds.access_key, "AKIAALIAS");
    assert_eq!(creds.secret_key, "alias-secret");
}

#[tokio::test]
async fn rejected_token_is_reported_as_such() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/secrets/abc"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let provider = HttpSecretProvider::new();
    let secret_ref = format!("{}/v1/secrets/abc", server.uri());

    let err = provider.fetch(&secret_ref, TOKEN).await.unwrap_err();
    assert!(err.to_string().contains("token"), "got: {err:#}");
}

#[tokio::test]
async fn missing_secret_is_reported_as_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/secrets/abc"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let provider = HttpSecretProvider::new();
    let secret_ref = format!("{}/v1/secrets/abc", server.uri());

    let err = provider.fetch(&secret_ref, TOKEN).await.unwrap_err();
    assert!(err.to_string().contains("No secret found"), "got: {err:#}");
}

#[tokio::test]
async fn non_json_payload_is_malformed() {
    let server =
        mock_secret_store(ResponseTemplate::new(200).set_body_string("-----BEGIN KEY-----")).await;

    let provider = HttpSecretProvider::new();
    let secret_ref = format!("{}/v1/secrets/abc", server.uri());

    let err = provider.fetch(&secret_ref, TOKEN).await.unwrap_err();
    assert!(err.to_string().contains("malformed"), "got: {err:#}");
}

#[tokio::test]
async fn empty_payload_is_malformed() {
    let server = mock_secret_store(ResponseTemplate::new(200).set_body_string("")).await;

    let provider = HttpSecretProvider::new();
    let secret_ref = format!("{}/v1/secrets/abc", server.uri());

    let err = provider.fetch(&secret_ref, TOKEN).await.unwrap_err();
    assert!(err.to_string().contains("malformed"), "got: {err:#}");
}

#[tokio::test]
async fn blank_inputs_fail_without_a_request() {
    let provider = HttpSecretProvider::new();

    let err = provider.fetch("", TOKEN).await.unwrap_err();
    assert!(err.to_string().contains("secret_ref"));

    let err = provider
        .fetch("https://secrets.example/v1/secrets/abc", "")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("token"));
}
