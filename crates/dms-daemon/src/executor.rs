//! Mount executor
//!
//! Server-side dispatch per target kind. S3 targets get credentials
//! resolved and a FUSE helper spawned through the registry; NFS targets
//! go through the privileged mount helper. Both kinds verify against the
//! kernel mount table and treat already-mounted / already-unmounted as
//! success.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use dms_core::domain::{BackupTarget, MountRequest, TargetKind};
use dms_core::ports::{ISecretProvider, S3Credentials};

use crate::mounts;
use crate::registry::{FuseProcessRegistry, RegistryError};

/// Bound on a single mount/umount helper invocation.
const HELPER_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from mount execution
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    /// The secret store denied or returned malformed credentials
    #[error("Secret fetch failed: {0}")]
    Secret(String),

    /// The mount helper reported a failure
    #[error("Mount helper failed: {0}")]
    Helper(String),

    /// The kernel does not show the expected mount state
    #[error("Mount verification failed: {0}")]
    Verify(String),

    /// The path would not unmount even with fallbacks
    #[error("Unmount failed for {path}: {detail}")]
    Unmount { path: String, detail: String },

    /// FUSE helper registry failure
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Filesystem I/O around the mount point failed
    #[error("Mount point I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Server-side mount/unmount dispatcher.
pub struct MountExecutor {
    registry: Arc<FuseProcessRegistry>,
    secrets: Arc<dyn ISecretProvider>,
    mount_helper: PathBuf,
    /// Wrapper configuration; when set, passed as the helper's first
    /// argument (rootwrap-style helpers expect it there).
    mount_helper_conf: Option<PathBuf>,
}

impl MountExecutor {
    pub fn new(
        registry: Arc<FuseProcessRegistry>,
        secrets: Arc<dyn ISecretProvider>,
        mount_helper: impl Into<PathBuf>,
        mount_helper_conf: Option<PathBuf>,
    ) -> Self {
        Self {
            registry,
            secrets,
            mount_helper: mount_helper.into(),
            mount_helper_conf,
        }
    }

    // ------------------------------------------------------------------
    // Mount
    // ------------------------------------------------------------------

    /// Mount the request's target; returns the mount path.
    pub async fn mount(&self, request: &MountRequest) -> Result<String, MountError> {
        let target = &request.backup_target;
        let mount_path = request.mount_path().to_string();

        match target.kind {
            TargetKind::S3 => self.mount_s3(request, target, &mount_path).await?,
            TargetKind::Nfs => self.mount_nfs(target, &mount_path).await?,
        }

        Ok(mount_path)
    }

    async fn mount_s3(
        &self,
        request: &MountRequest,
        target: &BackupTarget,
        mount_path: &str,
    ) -> Result<(), MountError> {
        // Validation upstream guarantees these are present.
        let secret_ref = target.secret_ref.as_deref().unwrap_or_default();
        let token = request.token.as_deref().unwrap_or_default();

        let credentials = self
            .secrets
            .fetch(secret_ref, token)
            .await
            .map_err(|e| MountError::Secret(format!("{e:#}")))?;

        let env = fuse_environment(&credentials, mount_path);
        debug!(
            target_id = %target.id,
            env = ?sanitized_env(&env),
            "Prepared FUSE helper environment"
        );

        self.registry
            .spawn(&target.id, Path::new(mount_path), &env)
            .await?;

        info!(target_id = %target.id, mount_path, "S3 target mounted");
        Ok(())
    }

    async fn mount_nfs(&self, target: &BackupTarget, mount_path: &str) -> Result<(), MountError> {
        std::fs::create_dir_all(mount_path)?;

        if mounts::is_mount_point(Path::new(mount_path))? {
            info!(target_id = %target.id, mount_path, "Path already mounted");
            return Ok(());
        }

        let export = target.filesystem_export.as_deref().unwrap_or_default();
        let options = target.nfs_mount_options();

        debug!(target_id = %target.id, export, options, "Invoking mount helper");
        let mut cmd = Command::new(&self.mount_helper);
        if let Some(conf) = &self.mount_helper_conf {
            cmd.arg(conf);
        }
        cmd.arg("-t")
            .arg("nfs")
            .arg("-o")
            .arg(options)
            .arg(export)
            .arg(mount_path);
        let output = run_helper(&mut cmd).await?;

        if !output.status.success() {
            return Err(MountError::Helper(format!(
                "mount of {export} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        if !mounts::is_mount_point(Path::new(mount_path))? {
            return Err(MountError::Verify(format!(
                "mount of {export} reported success but {mount_path} is not a mount point"
            )));
        }

        info!(target_id = %target.id, mount_path, "NFS target mounted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Unmount
    // ------------------------------------------------------------------

    /// Unmount the request's target. Not-mounted paths are successes.
    pub async fn unmount(&self, request: &MountRequest) -> Result<(), MountError> {
        let target = &request.backup_target;
        let mount_path = request.mount_path();

        if target.kind == TargetKind::S3 {
            // Stop the helper first so the unmount is not racing it.
            self.registry.kill(&target.id, false).await?;
        }

        umount_with_fallback(Path::new(mount_path)).await?;

        info!(target_id = %target.id, mount_path, "Target unmounted");
        Ok(())
    }
}

// ============================================================================
// Umount fallback chain
// ============================================================================

/// Unmount `path`, escalating from a plain umount to lazy and then
/// force+lazy. A path that is not mounted is an immediate success; each
/// attempt is verified against the kernel mount table.
pub(crate) async fn umount_with_fallback(path: &Path) -> Result<(), MountError> {
    if !mounts::is_mount_point(path)? {
        debug!(path = %path.display(), "Not mounted; unmount is a no-op");
        return Ok(());
    }

    let attempts: [&[&str]; 3] = [&[], &["-l"], &["-f", "-l"]];
    let mut last_detail = String::new();

    for extra_args in attempts {
        let output = run_helper(Command::new("umount").args(extra_args).arg(path)).await?;

        if !mounts::is_mount_point(path)? {
            if !extra_args.is_empty() {
                warn!(path = %path.display(), args = ?extra_args, "Unmounted via fallback");
            }
            return Ok(());
        }

        last_detail = format!(
            "umount {} exited with {}: {}",
            extra_args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        debug!(path = %path.display(), detail = %last_detail, "Unmount attempt failed");
    }

    Err(MountError::Unmount {
        path: path.display().to_string(),
        detail: last_detail,
    })
}

/// Run a helper command with the shared bounded timeout.
async fn run_helper(cmd: &mut Command) -> Result<std::process::Output, MountError> {
    match tokio::time::timeout(HELPER_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(MountError::Helper(e.to_string())),
        Err(_) => Err(MountError::Helper(format!(
            "helper did not finish within {}s",
            HELPER_TIMEOUT.as_secs()
        ))),
    }
}

// ============================================================================
// FUSE helper environment
// ============================================================================

/// Environment variable names understood by the FUSE helper.
const ENV_ACCESS_KEY: &str = "AWS_ACCESS_KEY_ID";
const ENV_SECRET_KEY: &str = "AWS_SECRET_ACCESS_KEY";
const ENV_BUCKET: &str = "DMS_S3_BUCKET";
const ENV_REGION: &str = "DMS_S3_REGION";
const ENV_ENDPOINT: &str = "DMS_S3_ENDPOINT_URL";
const ENV_SSL: &str = "DMS_S3_SSL";
const ENV_SSL_VERIFY: &str = "DMS_S3_SSL_VERIFY";
const ENV_DATA_DIR: &str = "DMS_DATA_DIR";

/// Compose the helper environment from resolved credentials.
///
/// The mount path always wins for the data directory so the kernel,
/// ledger, and helper agree on the same location. Unknown payload keys
/// pass through untouched for helper-specific tuning.
pub(crate) fn fuse_environment(
    credentials: &S3Credentials,
    mount_path: &str,
) -> HashMap<String, String> {
    let mut env = HashMap::new();

    env.insert(ENV_ACCESS_KEY.to_string(), credentials.access_key.clone());
    env.insert(ENV_SECRET_KEY.to_string(), credentials.secret_key.clone());
    if let Some(bucket) = &credentials.bucket {
        env.insert(ENV_BUCKET.to_string(), bucket.clone());
    }
    if let Some(region) = &credentials.region {
        env.insert(ENV_REGION.to_string(), region.clone());
    }
    if let Some(endpoint) = &credentials.endpoint_url {
        env.insert(ENV_ENDPOINT.to_string(), endpoint.clone());
    }
    env.insert(ENV_SSL.to_string(), credentials.ssl.to_string());
    env.insert(ENV_SSL_VERIFY.to_string(), credentials.ssl_verify.to_string());
    env.insert(ENV_DATA_DIR.to_string(), mount_path.to_string());

    for (key, value) in &credentials.extra {
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if !rendered.is_empty() {
            env.entry(key.clone()).or_insert(rendered);
        }
    }

    env
}

/// Substrings marking an environment key as secret-bearing.
const SENSITIVE_MARKERS: &[&str] = &["KEY", "SECRET", "PASSWORD", "TOKEN"];

/// Copy of `env` safe for logging: secret-bearing values are replaced.
pub(crate) fn sanitized_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let upper = k.to_uppercase();
            if SENSITIVE_MARKERS.iter().any(|m| upper.contains(m)) {
                (k.clone(), "***REDACTED***".to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(json: &str) -> S3Credentials {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn environment_carries_credentials_and_data_dir() {
        let creds = credentials(
            r#"{
                "access_key": "AKIAEXAMPLE",
                "secret_key": "shhh",
                "bucket": "backups",
                "region": "us-west-2",
                "endpoint_url": "https://s3.example:9000",
                "ssl": true,
                "ssl_verify": false
            }"#,
        );

        let env = fuse_environment(&creds, "/m/A");
        assert_eq!(env["AWS_ACCESS_KEY_ID"], "AKIAEXAMPLE");
        assert_eq!(env["AWS_SECRET_ACCESS_KEY"], "shhh");
        assert_eq!(env["DMS_S3_BUCKET"], "backups");
        assert_eq!(env["DMS_S3_REGION"], "us-west-2");
        assert_eq!(env["DMS_S3_ENDPOINT_URL"], "https://s3.example:9000");
        assert_eq!(env["DMS_S3_SSL"], "true");
        assert_eq!(env["DMS_S3_SSL_VERIFY"], "false");
        assert_eq!(env["DMS_DATA_DIR"], "/m/A");
    }

    #[test]
    fn extra_payload_keys_pass_through() {
        let creds = credentials(
            r#"{
                "access_key": "AKIA",
                "secret_key": "s",
                "max_pool_connections": 500,
                "helper_flag": "on"
            }"#,
        );

        let env = fuse_environment(&creds, "/m/A");
        assert_eq!(env["max_pool_connections"], "500");
        assert_eq!(env["helper_flag"], "on");
    }

    #[test]
    fn sanitizer_redacts_credential_values() {
        let creds = credentials(r#"{"access_key": "AKIA", "secret_key": "hunter2"}"#);
        let env = fuse_environment(&creds, "/m/A");
        let safe = sanitized_env(&env);

        assert_eq!(safe["AWS_SECRET_ACCESS_KEY"], "***REDACTED***");
        assert_eq!(safe["AWS_ACCESS_KEY_ID"], "***REDACTED***");
        assert_eq!(safe["DMS_DATA_DIR"], "/m/A");
        assert!(!safe.values().any(|v| v == "hunter2"));
    }

    #[tokio::test]
    async fn unmount_of_unmounted_path_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        umount_with_fallback(dir.path()).await.unwrap();
    }
}
