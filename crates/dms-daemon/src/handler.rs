//! Request handler
//!
//! Bridges the RPC serving loop to the mount executor. Every outcome,
//! including executor failures, becomes a [`MountResponse`]; the server
//! always replies.

use std::sync::Arc;

use tracing::error;

use dms_core::domain::{MountAction, MountRequest, MountResponse};
use dms_rpc::RpcHandler;

use crate::executor::MountExecutor;

/// Handler executing mount requests on this node.
pub struct MountHandler {
    executor: Arc<MountExecutor>,
}

impl MountHandler {
    pub fn new(executor: Arc<MountExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait::async_trait]
impl RpcHandler for MountHandler {
    async fn handle(&self, request: MountRequest) -> MountResponse {
        // Server-side validation is authoritative; clients may be older.
        if let Err(e) = request.validate() {
            return MountResponse::error(format!("invalid request: {e}"));
        }

        let target_id = request.backup_target.id.clone();

        match request.action {
            MountAction::Mount => match self.executor.mount(&request).await {
                Ok(mount_path) => MountResponse::success(
                    format!("target {target_id} mounted for job {}", request.job.id),
                    mount_path,
                ),
                Err(e) => {
                    error!(target_id = %target_id, error = %e, "Mount failed");
                    MountResponse::error(e.to_string())
                }
            },
            MountAction::Unmount => match self.executor.unmount(&request).await {
                Ok(()) => MountResponse {
                    status: dms_core::domain::ResponseStatus::Success,
                    success_msg: Some(format!(
                        "target {target_id} unmounted for job {}",
                        request.job.id
                    )),
                    error_msg: None,
                    mount_path: None,
                },
                Err(e) => {
                    error!(target_id = %target_id, error = %e, "Unmount failed");
                    MountResponse::error(e.to_string())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dms_core::domain::{
        BackupTarget, HostName, JobId, JobRef, RequestContext, TargetId, TargetKind, TargetStatus,
    };
    use dms_core::ports::{ISecretProvider, S3Credentials};

    use crate::registry::FuseProcessRegistry;

    use super::*;

    struct NoSecrets;

    #[async_trait::async_trait]
    impl ISecretProvider for NoSecrets {
        async fn fetch(&self, _secret_ref: &str, _token: &str) -> anyhow::Result<S3Credentials> {
            anyhow::bail!("no secrets in this test")
        }
    }

    fn handler(pid_dir: &std::path::Path) -> MountHandler {
        let registry = Arc::new(
            FuseProcessRegistry::new("/bin/false", pid_dir, Duration::from_secs(1)).unwrap(),
        );
        let executor = Arc::new(MountExecutor::new(
            registry,
            Arc::new(NoSecrets),
            "/bin/false",
            None,
        ));
        MountHandler::new(executor)
    }

    fn invalid_request() -> MountRequest {
        MountRequest {
            context: RequestContext::default(),
            token: Some("t".into()),
            job: JobRef {
                id: JobId::new(1),
                action: None,
            },
            host: HostName::new("h1").unwrap(),
            action: MountAction::Mount,
            backup_target: BackupTarget {
                id: TargetId::new("tgt-A").unwrap(),
                kind: TargetKind::S3,
                filesystem_export: None,
                filesystem_export_mount_path: "/m/A".into(),
                secret_ref: None, // missing: invalid for S3
                nfs_mount_opts: None,
                status: TargetStatus::Available,
                deleted: false,
            },
        }
    }

    #[tokio::test]
    async fn invalid_requests_get_error_replies() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path());

        let resp = handler.handle(invalid_request()).await;
        assert!(!resp.is_success());
        assert!(resp.error_msg.unwrap().contains("secret_ref"));
    }

    #[tokio::test]
    async fn secret_failures_become_error_replies() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path());

        let mut req = invalid_request();
        req.backup_target.secret_ref = Some("https://secrets.example/v1/secrets/x".into());

        let resp = handler.handle(req).await;
        assert!(!resp.is_success());
        assert!(resp.error_msg.unwrap().contains("Secret fetch failed"));
    }

    #[tokio::test]
    async fn unmount_of_unmounted_target_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path());

        let mount_dir = tempfile::tempdir().unwrap();
        let mut req = invalid_request();
        req.action = MountAction::Unmount;
        req.backup_target.secret_ref = Some("https://secrets.example/v1/secrets/x".into());
        req.backup_target.filesystem_export_mount_path =
            mount_dir.path().to_string_lossy().into_owned();

        let resp = handler.handle(req).await;
        assert!(resp.is_success(), "unmount of a non-mounted path is benign");
    }
}
