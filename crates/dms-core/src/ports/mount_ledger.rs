//! Mount ledger port (driven/secondary port)
//!
//! Interface for the durable ledger of (job, target, host) bindings.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific
//!   and don't need domain-level classification.
//! - All state-mutating operations are single atomic writes; the
//!   count-then-update sequences of the coordinator are serialized by the
//!   host lock, so no serializable isolation is required here.
//! - "Live" rows are those with `deleted = false`. Queries operate on
//!   live rows unless documented otherwise.

use crate::domain::{
    HostName, LastAction, LedgerEntry, LedgerKey, TargetId,
};

/// Filter criteria for listing active bindings.
///
/// All fields are optional; `None` applies no filtering for that field.
#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    /// Restrict to one host
    pub host: Option<HostName>,
    /// Restrict to one backup target
    pub target_id: Option<TargetId>,
}

impl LedgerFilter {
    /// Creates an empty filter (matches all active rows)
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the host filter
    pub fn with_host(mut self, host: HostName) -> Self {
        self.host = Some(host);
        self
    }

    /// Sets the target filter
    pub fn with_target(mut self, target_id: TargetId) -> Self {
        self.target_id = Some(target_id);
        self
    }
}

/// Port trait for the durable mount ledger
#[async_trait::async_trait]
pub trait IMountLedger: Send + Sync {
    /// Create or reset the live row for `key` to `(status=pending,
    /// mounted unchanged-or-false-on-create)`, recording the request blob
    /// and the requested action. Returns the row id.
    async fn upsert_pending(
        &self,
        key: &LedgerKey,
        action: LastAction,
        request_data: &str,
    ) -> anyhow::Result<i64>;

    /// Mark the live row for `key` as successful: set `status=success`,
    /// the `mounted` flag, the mount path, the response blob, a human
    /// message, and `completed_at`.
    async fn mark_success(
        &self,
        key: &LedgerKey,
        mount_path: Option<&str>,
        response_data: &str,
        success_msg: &str,
        mounted: bool,
    ) -> anyhow::Result<()>;

    /// Mark the live row for `key` as failed: set `status=error`, the
    /// error message, the response blob, and `completed_at`. The
    /// `mounted` flag is left unchanged.
    async fn mark_error(
        &self,
        key: &LedgerKey,
        error_msg: &str,
        response_data: &str,
    ) -> anyhow::Result<()>;

    /// Number of live rows for (target, host) with `mounted = true`.
    ///
    /// This is the reference count the unmount decision is based on.
    async fn count_active(&self, target_id: &TargetId, host: &HostName) -> anyhow::Result<i64>;

    /// Fetch the live row for `key`, if any
    async fn get_by_key(&self, key: &LedgerKey) -> anyhow::Result<Option<LedgerEntry>>;

    /// List active (`mounted AND NOT deleted`) rows matching the filter
    async fn list_active(&self, filter: &LedgerFilter) -> anyhow::Result<Vec<LedgerEntry>>;

    /// History for a target, newest first, bounded by `limit`.
    ///
    /// Soft-deleted rows are included; history is retained for forensics.
    async fn history_by_target(
        &self,
        target_id: &TargetId,
        limit: u32,
    ) -> anyhow::Result<Vec<LedgerEntry>>;

    /// Soft-delete the live row for `key`. Returns whether a row was
    /// affected.
    async fn soft_delete(&self, key: &LedgerKey) -> anyhow::Result<bool>;
}
