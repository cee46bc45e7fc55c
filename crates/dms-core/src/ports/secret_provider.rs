//! Secret provider port (driven/secondary port)
//!
//! Interface for resolving a secret reference into S3 credentials using
//! the caller's bearer token. Credentials are fetched on every mount and
//! never cached.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;

/// S3 credentials and helper settings resolved from the secret store.
///
/// Unknown payload keys are preserved in `extra` and passed through to
/// the FUSE helper environment. The `Debug` impl redacts the secret key
/// so credentials cannot leak through logging.
#[derive(Clone, Deserialize)]
pub struct S3Credentials {
    #[serde(alias = "aws_access_key_id")]
    pub access_key: String,
    #[serde(alias = "aws_secret_access_key")]
    pub secret_key: String,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_true")]
    pub ssl: bool,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"***REDACTED***")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("ssl", &self.ssl)
            .field("ssl_verify", &self.ssl_verify)
            .finish_non_exhaustive()
    }
}

/// Port trait for the secret store client
#[async_trait::async_trait]
pub trait ISecretProvider: Send + Sync {
    /// Resolve `secret_ref` into credentials using the caller's token.
    ///
    /// Denied access, missing secrets, and malformed payloads are errors;
    /// results must not be cached by implementations.
    async fn fetch(&self, secret_ref: &str, token: &str) -> anyhow::Result<S3Credentials>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_deserialize_with_aliases() {
        let json = r#"{
            "aws_access_key_id": "AKIAEXAMPLE",
            "aws_secret_access_key": "very-secret",
            "bucket": "backups",
            "endpoint_url": "https://s3.example:9000",
            "ssl": false,
            "max_pool_connections": 500
        }"#;
        let creds: S3Credentials = serde_json::from_str(json).unwrap();
        assert_eq!(creds.access_key, "AKIAEXAMPLE");
        assert_eq!(creds.secret_key, "very-secret");
        assert_eq!(creds.bucket.as_deref(), Some("backups"));
        assert!(!creds.ssl);
        assert!(creds.ssl_verify);
        assert_eq!(creds.extra["max_pool_connections"], 500);
    }

    #[test]
    fn debug_redacts_the_secret_key() {
        let creds: S3Credentials = serde_json::from_str(
            r#"{"access_key": "AKIA", "secret_key": "hunter2"}"#,
        )
        .unwrap();
        let debug = format!("{creds:?}");
        assert!(debug.contains("***REDACTED***"));
        assert!(!debug.contains("hunter2"));
    }
}
