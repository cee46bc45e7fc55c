//! Backup target description
//!
//! A backup target is an addressable remote storage endpoint (an S3
//! bucket or an NFS export) that jobs need mounted. Targets travel
//! embedded in mount requests; the core never stores them.

use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::TargetId;

// ============================================================================
// TargetKind / TargetStatus
// ============================================================================

/// Kind of storage backing a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// S3 bucket exposed through a long-lived FUSE helper process
    S3,
    /// NFS export mounted through the privileged mount helper
    Nfs,
}

impl TargetKind {
    /// Stable lowercase name used on the wire and in logs
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::S3 => "s3",
            TargetKind::Nfs => "nfs",
        }
    }
}

impl Display for TargetKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s3" => Ok(TargetKind::S3),
            "nfs" => Ok(TargetKind::Nfs),
            other => Err(DomainError::ValidationFailed(format!(
                "unknown target type '{other}'"
            ))),
        }
    }
}

/// Operational status of a target as reported by its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Available,
    Unavailable,
}

impl Default for TargetStatus {
    fn default() -> Self {
        TargetStatus::Available
    }
}

// ============================================================================
// BackupTarget
// ============================================================================

/// Request-embedded description of a backup target.
///
/// `filesystem_export_mount_path` is authoritative for the absolute mount
/// point; the service never rewrites or derives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupTarget {
    /// Target identifier, also the pid-file stem for S3 targets
    pub id: TargetId,
    /// Storage kind
    #[serde(rename = "type")]
    pub kind: TargetKind,
    /// NFS export in `host:/path` form; ignored for S3 targets
    #[serde(default)]
    pub filesystem_export: Option<String>,
    /// Absolute mount point, supplied by the caller
    pub filesystem_export_mount_path: String,
    /// Secret-store reference resolving to S3 credentials
    #[serde(default)]
    pub secret_ref: Option<String>,
    /// Comma-separated NFS mount options
    #[serde(default)]
    pub nfs_mount_opts: Option<String>,
    /// Operational status
    #[serde(default)]
    pub status: TargetStatus,
    /// Soft-delete marker propagated from the target's owner
    #[serde(default)]
    pub deleted: bool,
}

impl BackupTarget {
    /// Validate the per-kind field requirements.
    ///
    /// - the mount path must be present and absolute
    /// - S3 targets require `secret_ref` (`filesystem_export` is ignored)
    /// - NFS targets require `filesystem_export`
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.filesystem_export_mount_path.is_empty() {
            return Err(DomainError::MissingField(
                "filesystem_export_mount_path".into(),
            ));
        }
        if !Path::new(&self.filesystem_export_mount_path).is_absolute() {
            return Err(DomainError::ValidationFailed(format!(
                "mount path '{}' is not absolute",
                self.filesystem_export_mount_path
            )));
        }

        match self.kind {
            TargetKind::S3 => {
                if self.secret_ref.as_deref().unwrap_or("").is_empty() {
                    return Err(DomainError::MissingField("secret_ref".into()));
                }
            }
            TargetKind::Nfs => {
                if self.filesystem_export.as_deref().unwrap_or("").is_empty() {
                    return Err(DomainError::MissingField("filesystem_export".into()));
                }
            }
        }

        Ok(())
    }

    /// NFS mount options with the conventional fallback
    #[must_use]
    pub fn nfs_mount_options(&self) -> &str {
        self.nfs_mount_opts.as_deref().unwrap_or("defaults")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn s3_target() -> BackupTarget {
        BackupTarget {
            id: TargetId::new("tgt-A").unwrap(),
            kind: TargetKind::S3,
            filesystem_export: None,
            filesystem_export_mount_path: "/m/A".to_string(),
            secret_ref: Some("https://secrets.example/v1/secrets/abc".to_string()),
            nfs_mount_opts: None,
            status: TargetStatus::Available,
            deleted: false,
        }
    }

    fn nfs_target() -> BackupTarget {
        BackupTarget {
            id: TargetId::new("tgt-N").unwrap(),
            kind: TargetKind::Nfs,
            filesystem_export: Some("filer-1:/exports/backups".to_string()),
            filesystem_export_mount_path: "/m/N".to_string(),
            secret_ref: None,
            nfs_mount_opts: Some("vers=4.1,rw".to_string()),
            status: TargetStatus::Available,
            deleted: false,
        }
    }

    #[test]
    fn kind_round_trips_lowercase() {
        assert_eq!(serde_json::to_string(&TargetKind::S3).unwrap(), "\"s3\"");
        assert_eq!(serde_json::to_string(&TargetKind::Nfs).unwrap(), "\"nfs\"");
        assert_eq!("s3".parse::<TargetKind>().unwrap(), TargetKind::S3);
        assert!("ceph".parse::<TargetKind>().is_err());
    }

    #[test]
    fn valid_targets_pass() {
        s3_target().validate().unwrap();
        nfs_target().validate().unwrap();
    }

    #[test]
    fn s3_requires_secret_ref() {
        let mut t = s3_target();
        t.secret_ref = None;
        assert!(matches!(
            t.validate(),
            Err(DomainError::MissingField(f)) if f == "secret_ref"
        ));

        t.secret_ref = Some(String::new());
        assert!(t.validate().is_err());
    }

    #[test]
    fn s3_ignores_filesystem_export() {
        let mut t = s3_target();
        t.filesystem_export = Some("whatever:/ignored".to_string());
        t.validate().unwrap();
    }

    #[test]
    fn nfs_requires_export() {
        let mut t = nfs_target();
        t.filesystem_export = None;
        assert!(matches!(
            t.validate(),
            Err(DomainError::MissingField(f)) if f == "filesystem_export"
        ));
    }

    #[test]
    fn mount_path_must_be_absolute() {
        let mut t = s3_target();
        t.filesystem_export_mount_path = "relative/path".to_string();
        assert!(t.validate().is_err());

        t.filesystem_export_mount_path = String::new();
        assert!(matches!(
            t.validate(),
            Err(DomainError::MissingField(f)) if f == "filesystem_export_mount_path"
        ));
    }

    #[test]
    fn nfs_mount_options_fallback() {
        let mut t = nfs_target();
        assert_eq!(t.nfs_mount_options(), "vers=4.1,rw");
        t.nfs_mount_opts = None;
        assert_eq!(t.nfs_mount_options(), "defaults");
    }

    #[test]
    fn target_deserializes_from_wire_json() {
        let json = r#"{
            "id": "tgt-A",
            "type": "s3",
            "filesystem_export": null,
            "filesystem_export_mount_path": "/m/A",
            "secret_ref": "https://secrets.example/v1/secrets/abc",
            "nfs_mount_opts": null,
            "status": "available",
            "deleted": false
        }"#;
        let t: BackupTarget = serde_json::from_str(json).unwrap();
        assert_eq!(t, s3_target());
    }
}
