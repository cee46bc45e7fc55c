//! Mount request and response shapes
//!
//! These are the payloads exchanged between the coordinator and the
//! per-node server over the broker, as UTF-8 JSON. The same structs are
//! stored opaquely in the ledger's request/response blobs.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{HostName, JobId};
use super::target::BackupTarget;

// ============================================================================
// Request context
// ============================================================================

/// Caller identity attached to every request, passed through opaquely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Reference to the job driving the request.
///
/// `id` is a signed integer on the wire; extra job fields are carried but
/// not interpreted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub id: JobId,
    #[serde(default)]
    pub action: Option<String>,
}

// ============================================================================
// MountAction
// ============================================================================

/// The operation a request asks the server to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountAction {
    Mount,
    Unmount,
}

impl MountAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MountAction::Mount => "mount",
            MountAction::Unmount => "unmount",
        }
    }
}

impl Display for MountAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// MountRequest
// ============================================================================

/// A mount or unmount request for one (job, target, host) binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRequest {
    #[serde(default)]
    pub context: RequestContext,
    /// Opaque bearer token forwarded to the secret store
    #[serde(default)]
    pub token: Option<String>,
    pub job: JobRef,
    pub host: HostName,
    pub action: MountAction,
    pub backup_target: BackupTarget,
}

impl MountRequest {
    /// Validate the request against the per-kind field rules.
    ///
    /// Host and identifier shape are already enforced by the newtypes at
    /// deserialization; this adds the target rules and the S3 token
    /// requirement for mounts.
    pub fn validate(&self) -> Result<(), DomainError> {
        self.backup_target.validate()?;

        if self.action == MountAction::Mount
            && self.backup_target.kind == super::target::TargetKind::S3
            && self.token.as_deref().unwrap_or("").is_empty()
        {
            return Err(DomainError::MissingField("token".into()));
        }

        Ok(())
    }

    /// Logical ledger key of this request
    #[must_use]
    pub fn ledger_key(&self) -> super::ledger::LedgerKey {
        super::ledger::LedgerKey {
            job_id: self.job.id,
            target_id: self.backup_target.id.clone(),
            host: self.host.clone(),
        }
    }

    /// The caller-supplied absolute mount point
    #[must_use]
    pub fn mount_path(&self) -> &str {
        &self.backup_target.filesystem_export_mount_path
    }
}

// ============================================================================
// MountResponse
// ============================================================================

/// Outcome reported by the server (or synthesized by the coordinator)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

impl ResponseStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Success => "success",
            ResponseStatus::Error => "error",
        }
    }
}

impl Display for ResponseStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply to a [`MountRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountResponse {
    pub status: ResponseStatus,
    #[serde(default)]
    pub success_msg: Option<String>,
    #[serde(default)]
    pub error_msg: Option<String>,
    #[serde(default)]
    pub mount_path: Option<String>,
}

impl MountResponse {
    /// Build a success reply
    #[must_use]
    pub fn success(msg: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Success,
            success_msg: Some(msg.into()),
            error_msg: None,
            mount_path: Some(mount_path.into()),
        }
    }

    /// Build an error reply
    #[must_use]
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            success_msg: None,
            error_msg: Some(msg.into()),
            mount_path: None,
        }
    }

    /// Whether the reply reports success
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

// ============================================================================
// Tests
// ============================================================================
