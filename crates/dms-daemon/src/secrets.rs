//! Secret store client
//!
//! Resolves a secret reference into S3 credentials with the caller's
//! bearer token: one request for the secret metadata, one for the
//! payload. Credentials are fetched on every mount and never cached.

use std::time::Duration;

use reqwest::StatusCode;
use tracing::debug;

use dms_core::ports::{ISecretProvider, S3Credentials};

/// Header carrying the caller's token to the secret store.
const AUTH_HEADER: &str = "X-Auth-Token";

/// Per-request timeout against the secret store.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from secret resolution
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// The request could not be sent or timed out
    #[error("Secret request failed: {0}")]
    Request(String),

    /// The token was rejected
    #[error("Secret store rejected the token (expired or invalid)")]
    Unauthorized,

    /// The token lacks access to this secret
    #[error("Access to the secret was denied; check token scope")]
    Forbidden,

    /// No secret exists at the reference
    #[error("No secret found at {0}")]
    NotFound(String),

    /// The secret store answered with an unexpected status
    #[error("Secret store returned {0}")]
    Status(StatusCode),

    /// The payload is not usable as credentials
    #[error("Secret payload malformed: {0}")]
    Malformed(String),
}

/// HTTP client for the secret store.
pub struct HttpSecretProvider {
    http: reqwest::Client,
}

impl HttpSecretProvider {
    /// Create a provider with the default request timeout.
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { http }
    }

    async fn fetch_inner(
        &self,
        secret_ref: &str,
        token: &str,
    ) -> Result<S3Credentials, SecretError> {
        if secret_ref.is_empty() {
            return Err(SecretError::Request("secret_ref is empty".into()));
        }
        if token.is_empty() {
            return Err(SecretError::Request("token is empty".into()));
        }

        debug!(secret_ref, "Fetching secret metadata");
        let metadata = self
            .http
            .get(secret_ref)
            .header(AUTH_HEADER, token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| SecretError::Request(e.to_string()))?;
        map_status(metadata.status(), secret_ref)?;

        // The metadata itself is only fetched to confirm the reference
        // resolves; the credentials live in the payload document.
        let _meta: serde_json::Value = metadata
            .json()
            .await
            .map_err(|e| SecretError::Malformed(format!("metadata: {e}")))?;

        let payload_url = format!("{}/payload", secret_ref.trim_end_matches('/'));
        debug!(payload_url = %payload_url, "Fetching secret payload");
        let payload = self
            .http
            .get(&payload_url)
            .header(AUTH_HEADER, token)
            .send()
            .await
            .map_err(|e| SecretError::Request(e.to_string()))?;
        map_status(payload.status(), &payload_url)?;

        let body = payload
            .text()
            .await
            .map_err(|e| SecretError::Request(e.to_string()))?;
        if body.trim().is_empty() {
            return Err(SecretError::Malformed("payload is empty".into()));
        }

        serde_json::from_str::<S3Credentials>(&body)
            .map_err(|e| SecretError::Malformed(e.to_string()))
    }
}

impl Default for HttpSecretProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn map_status(status: StatusCode, what: &str) -> Result<(), SecretError> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED => Err(SecretError::Unauthorized),
        StatusCode::FORBIDDEN => Err(SecretError::Forbidden),
        StatusCode::NOT_FOUND => Err(SecretError::NotFound(what.to_string())),
        other => Err(SecretError::Status(other)),
    }
}

#[async_trait::async_trait]
impl ISecretProvider for HttpSecretProvider {
    async fn fetch(&self, secret_ref: &str, token: &str) -> anyhow::Result<S3Credentials> {
        Ok(self.fetch_inner(secret_ref, token).await?)
    }
}
