//! SQLite implementation of IMountLedger
//!
//! This module provides the concrete SQLite-based implementation of the
//! mount ledger port defined in dms-core. It handles all domain type
//! serialization/deserialization and SQL query construction.
//!
//! ## Type Mapping
//!
//! | Domain Type    | SQL Type | Strategy                                |
//! |----------------|----------|-----------------------------------------|
//! | JobId          | INTEGER  | `as_i64()` / `JobId::new`               |
//! | TargetId, HostName | TEXT | `as_str()` / fallible constructors      |
//! | LastAction, LastStatus | TEXT | `as_str()` / `FromStr`            |
//! | DateTime<Utc>  | TEXT     | ISO 8601 via `to_rfc3339()`             |
//! | bool flags     | INTEGER  | 0/1                                     |

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use dms_core::domain::{
    HostName, JobId, LastAction, LastStatus, LedgerEntry, LedgerKey, TargetId,
};
use dms_core::ports::{IMountLedger, LedgerFilter};

use crate::LedgerError;

/// SQLite-based implementation of the mount ledger port
///
/// All operations are performed through a connection pool. Each
/// state-mutating operation is a single statement; the coordinator's host
/// lock serializes the count-then-update sequences that span statements.
pub struct SqliteMountLedger {
    pool: SqlitePool,
}

impl SqliteMountLedger {
    /// Creates a new ledger instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

/// Parse a DateTime<Utc> from an ISO 8601 string
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Tolerate SQLite's default timestamp format
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
                .map(|ndt| ndt.and_utc())
        })
        .map_err(|e| {
            LedgerError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

/// Parse an optional DateTime<Utc> from an optional string
fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, LedgerError> {
    match s {
        Some(ref val) if !val.is_empty() => parse_datetime(val).map(Some),
        _ => Ok(None),
    }
}

// ============================================================================
// Row mapping
// ============================================================================

/// Reconstruct a LedgerEntry from a database row
fn entry_from_row(row: &SqliteRow) -> Result<LedgerEntry, LedgerError> {
    let id: i64 = row.get("id");
    let job_id: i64 = row.get("job_id");
    let target_id_str: String = row.get("backup_target_id");
    let host_str: String = row.get("host");
    let mounted: i64 = row.get("mounted");
    let mount_path: Option<String> = row.get("mount_path");
    let action_str: String = row.get("action_last");
    let status_str: String = row.get("status_last");
    let request_data: Option<String> = row.get("request_data");
    let response_data: Option<String> = row.get("response_data");
    let error_msg: Option<String> = row.get("error_msg");
    let success_msg: Option<String> = row.get("success_msg");
    let created_at_str: String = row.get("created_at");
    let updated_at_str: String = row.get("updated_at");
    let completed_at_str: Option<String> = row.get("completed_at");
    let deleted: i64 = row.get("deleted");
    let deleted_at_str: Option<String> = row.get("deleted_at");

    let target_id = TargetId::new(target_id_str.clone()).map_err(|e| {
        LedgerError::SerializationError(format!("Invalid target id '{target_id_str}': {e}"))
    })?;
    let host = HostName::new(host_str.clone()).map_err(|e| {
        LedgerError::SerializationError(format!("Invalid host '{host_str}': {e}"))
    })?;
    let action_last: LastAction = action_str.parse().map_err(|e| {
        LedgerError::SerializationError(format!("Invalid action '{action_str}': {e}"))
    })?;
    let status_last: LastStatus = status_str.parse().map_err(|e| {
        LedgerError::SerializationError(format!("Invalid status '{status_str}': {e}"))
    })?;

    Ok(LedgerEntry {
        id,
        job_id: JobId::new(job_id),
        target_id,
        host,
        mounted: mounted != 0,
        mount_path,
        action_last,
        status_last,
        request_data,
        response_data,
        error_msg,
        success_msg,
        created_at: parse_datetime(&created_at_str)?,
        updated_at: parse_datetime(&updated_at_str)?,
        completed_at: parse_optional_datetime(completed_at_str)?,
        deleted: deleted != 0,
        deleted_at: parse_optional_datetime(deleted_at_str)?,
    })
}

// ============================================================================
// IMountLedger implementation
// ============================================================================

#[async_trait::async_trait]
impl IMountLedger for SqliteMountLedger {
    async fn upsert_pending(
        &self,
        key: &LedgerKey,
        action: LastAction,
        request_data: &str,
    ) -> anyhow::Result<i64> {
        let now = Utc::now().to_rfc3339();

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM backup_target_mount_ledger \
             WHERE job_id = ? AND backup_target_id = ? AND host = ? AND deleted = 0",
        )
        .bind(key.job_id.as_i64())
        .bind(key.target_id.as_str())
        .bind(key.host.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(LedgerError::from)?;

        let id = match existing {
            Some(id) => {
                // Re-use the live binding: reset it to pending for the new
                // request, keeping the mounted flag as-is.
                sqlx::query(
                    "UPDATE backup_target_mount_ledger \
                     SET action_last = ?, status_last = 'pending', request_data = ?, \
                         response_data = NULL, error_msg = NULL, success_msg = NULL, \
                         completed_at = NULL, updated_at = ? \
                     WHERE id = ?",
                )
                .bind(action.as_str())
                .bind(request_data)
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(LedgerError::from)?;
                id
            }
            None => {
                let result = sqlx::query(
                    "INSERT INTO backup_target_mount_ledger \
                     (job_id, backup_target_id, host, mounted, action_last, status_last, \
                      request_data, created_at, updated_at, deleted) \
                     VALUES (?, ?, ?, 0, ?, 'pending', ?, ?, ?, 0)",
                )
                .bind(key.job_id.as_i64())
                .bind(key.target_id.as_str())
                .bind(key.host.as_str())
                .bind(action.as_str())
                .bind(request_data)
                .bind(&now)
                .bind(&now)
                .execute(&self.pool)
                .await
                .map_err(LedgerError::from)?;
                result.last_insert_rowid()
            }
        };

        tracing::debug!(ledger_id = id, key = %key, action = %action.as_str(), "Ledger row pending");
        Ok(id)
    }

    async fn mark_success(
        &self,
        key: &LedgerKey,
        mount_path: Option<&str>,
        response_data: &str,
        success_msg: &str,
        mounted: bool,
    ) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            "UPDATE backup_target_mount_ledger \
             SET status_last = 'success', mounted = ?, mount_path = ?, \
                 response_data = ?, success_msg = ?, error_msg = NULL, \
                 completed_at = ?, updated_at = ? \
             WHERE job_id = ? AND backup_target_id = ? AND host = ? AND deleted = 0",
        )
        .bind(mounted as i64)
        .bind(mount_path)
        .bind(response_data)
        .bind(success_msg)
        .bind(&now)
        .bind(&now)
        .bind(key.job_id.as_i64())
        .bind(key.target_id.as_str())
        .bind(key.host.as_str())
        .execute(&self.pool)
        .await
        .map_err(LedgerError::from)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::RowNotFound(key.to_string()).into());
        }

        tracing::debug!(key = %key, mounted, "Ledger row marked success");
        Ok(())
    }

    async fn mark_error(
        &self,
        key: &LedgerKey,
        error_msg: &str,
        response_data: &str,
    ) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            "UPDATE backup_target_mount_ledger \
             SET status_last = 'error', error_msg = ?, response_data = ?, \
                 completed_at = ?, updated_at = ? \
             WHERE job_id = ? AND backup_target_id = ? AND host = ? AND deleted = 0",
        )
        .bind(error_msg)
        .bind(response_data)
        .bind(&now)
        .bind(&now)
        .bind(key.job_id.as_i64())
        .bind(key.target_id.as_str())
        .bind(key.host.as_str())
        .execute(&self.pool)
        .await
        .map_err(LedgerError::from)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::RowNotFound(key.to_string()).into());
        }

        tracing::debug!(key = %key, "Ledger row marked error");
        Ok(())
    }

    async fn count_active(&self, target_id: &TargetId, host: &HostName) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM backup_target_mount_ledger \
             WHERE backup_target_id = ? AND host = ? AND mounted = 1 AND deleted = 0",
        )
        .bind(target_id.as_str())
        .bind(host.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(LedgerError::from)?;

        Ok(count)
    }

    async fn get_by_key(&self, key: &LedgerKey) -> anyhow::Result<Option<LedgerEntry>> {
        let row = sqlx::query(
            "SELECT * FROM backup_target_mount_ledger \
             WHERE job_id = ? AND backup_target_id = ? AND host = ? AND deleted = 0",
        )
        .bind(key.job_id.as_i64())
        .bind(key.target_id.as_str())
        .bind(key.host.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(LedgerError::from)?;

        match row {
            Some(ref r) => Ok(Some(entry_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn list_active(&self, filter: &LedgerFilter) -> anyhow::Result<Vec<LedgerEntry>> {
        let mut sql = String::from(
            "SELECT * FROM backup_target_mount_ledger WHERE mounted = 1 AND deleted = 0",
        );
        let mut binds: Vec<String> = Vec::new();

        if let Some(ref host) = filter.host {
            sql.push_str(" AND host = ?");
            binds.push(host.as_str().to_string());
        }
        if let Some(ref target_id) = filter.target_id {
            sql.push_str(" AND backup_target_id = ?");
            binds.push(target_id.as_str().to_string());
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(LedgerError::from)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(entry_from_row(row)?);
        }
        Ok(entries)
    }

    async fn history_by_target(
        &self,
        target_id: &TargetId,
        limit: u32,
    ) -> anyhow::Result<Vec<LedgerEntry>> {
        // History deliberately includes soft-deleted rows.
        let rows = sqlx::query(
            "SELECT * FROM backup_target_mount_ledger \
             WHERE backup_target_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(target_id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(LedgerError::from)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(entry_from_row(row)?);
        }
        Ok(entries)
    }

    async fn soft_delete(&self, key: &LedgerKey) -> anyhow::Result<bool> {
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            "UPDATE backup_target_mount_ledger \
             SET deleted = 1, deleted_at = ?, updated_at = ? \
             WHERE job_id = ? AND backup_target_id = ? AND host = ? AND deleted = 0",
        )
        .bind(&now)
        .bind(&now)
        .bind(key.job_id.as_i64())
        .bind(key.target_id.as_str())
        .bind(key.host.as_str())
        .execute(&self.pool)
        .await
        .map_err(LedgerError::from)?;

        let affected = result.rows_affected() > 0;
        if affected {
            tracing::info!(key = %key, "Ledger row soft-deleted");
        }
        Ok(affected)
    }
}
