//! Mount ledger entries
//!
//! One ledger row per (job, target, host) binding, recording whether the
//! binding currently holds a reference to the physical mount and the
//! outcome of the last request that touched it.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{HostName, JobId, TargetId};

// ============================================================================
// LedgerKey
// ============================================================================

/// Logical key of a binding: (job, target, host).
///
/// Unique among live (non-deleted) rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    pub job_id: JobId,
    pub target_id: TargetId,
    pub host: HostName,
}

impl Display for LedgerKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "job={} target={} host={}", self.job_id, self.target_id, self.host)
    }
}

// ============================================================================
// LastAction / LastStatus
// ============================================================================

/// The last action requested against a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastAction {
    Mount,
    Unmount,
}

impl LastAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LastAction::Mount => "mount",
            LastAction::Unmount => "unmount",
        }
    }
}

impl FromStr for LastAction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mount" => Ok(LastAction::Mount),
            "unmount" => Ok(LastAction::Unmount),
            other => Err(DomainError::ValidationFailed(format!(
                "unknown ledger action '{other}'"
            ))),
        }
    }
}

/// Outcome of the last request against a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastStatus {
    Pending,
    Success,
    Error,
}

impl LastStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LastStatus::Pending => "pending",
            LastStatus::Success => "success",
            LastStatus::Error => "error",
        }
    }
}

impl FromStr for LastStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LastStatus::Pending),
            "success" => Ok(LastStatus::Success),
            "error" => Ok(LastStatus::Error),
            other => Err(DomainError::ValidationFailed(format!(
                "unknown ledger status '{other}'"
            ))),
        }
    }
}

// ============================================================================
// LedgerEntry
// ============================================================================

/// A full ledger row.
///
/// `request_data`/`response_data` are opaque JSON blobs kept for
/// forensics; the coordinator never interprets them after writing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Surrogate row id
    pub id: i64,
    pub job_id: JobId,
    pub target_id: TargetId,
    pub host: HostName,
    /// Whether this binding currently references the physical mount
    pub mounted: bool,
    pub mount_path: Option<String>,
    pub action_last: LastAction,
    pub status_last: LastStatus,
    pub request_data: Option<String>,
    pub response_data: Option<String>,
    pub error_msg: Option<String>,
    pub success_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    /// Logical key of this row
    #[must_use]
    pub fn key(&self) -> LedgerKey {
        LedgerKey {
            job_id: self.job_id,
            target_id: self.target_id.clone(),
            host: self.host.clone(),
        }
    }

    /// Whether the row contributes to the reference count:
    /// `mounted` and not soft-deleted.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.mounted && !self.deleted
    }
}
