//! Reference-counted mount coordinator
//!
//! Implements the client-side mount protocol: every decision runs under
//! the host lock, the ledger is written before the lock is released, and
//! the physical unmount happens exactly on the request that takes the
//! active count for (target, host) from 1 to 0.

use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use dms_core::domain::{
    DomainError, LastAction, LedgerEntry, LedgerKey, MountAction, MountRequest, MountResponse,
    ResponseStatus,
};
use dms_core::ports::{IMountLedger, IMountTransport, LedgerFilter};

use crate::lock::{HostLock, LockError};

// ============================================================================
// Errors and outcomes
// ============================================================================

/// Errors surfaced to coordinator callers.
///
/// Operational failures reported by the server arrive as error
/// [`MountResponse`]s, not as `Err` values: the ledger records them and
/// the caller decides what to do. `Err` is reserved for conditions where
/// nothing was recorded (validation, lock timeout) or the ledger itself
/// is unavailable.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// The request is malformed; the ledger was not touched
    #[error(transparent)]
    Validation(#[from] DomainError),

    /// The host lock was not acquired; the ledger was not touched
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The ledger store failed
    #[error("Ledger operation failed: {0}")]
    Ledger(String),

    /// Internal encoding failure
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result of an unmount decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmountOutcome {
    /// Overall outcome of the request
    pub status: ResponseStatus,
    /// Whether the kernel-level unmount was performed by this request
    pub physically_unmounted: bool,
    /// Active bindings left for (target, host) after this request
    pub remaining: i64,
    /// Human-readable summary
    pub message: String,
}

// ============================================================================
// MountCoordinator
// ============================================================================

/// Client-side mount/unmount protocol.
///
/// Dependencies are injected so tests can swap the ledger and transport;
/// production wiring uses `dms-ledger` and `dms-rpc`.
pub struct MountCoordinator {
    ledger: Arc<dyn IMountLedger>,
    transport: Arc<dyn IMountTransport>,
    lock: HostLock,
}

impl MountCoordinator {
    /// Create a coordinator over the given adapters.
    pub fn new(
        ledger: Arc<dyn IMountLedger>,
        transport: Arc<dyn IMountTransport>,
        lock: HostLock,
    ) -> Self {
        Self {
            ledger,
            transport,
            lock,
        }
    }

    // ------------------------------------------------------------------
    // Mount
    // ------------------------------------------------------------------

    /// Request a mount for the binding described by `request`.
    ///
    /// Under the host lock: record the binding as pending, call the
    /// node's server, then record the outcome. The server mounts at most
    /// once per (target, host); repeat mounts are idempotent successes.
    pub async fn mount(&self, mut request: MountRequest) -> Result<MountResponse, CoordinatorError> {
        request.action = MountAction::Mount;
        request.validate()?;
        let key = request.ledger_key();
        let request_blob = encode(&request)?;

        let _guard = self.lock.acquire().await?;

        self.ledger
            .upsert_pending(&key, LastAction::Mount, &request_blob)
            .await
            .map_err(ledger_err)?;

        let response = match self.transport.call(&request).await {
            Ok(mut resp) if resp.is_success() => {
                // The reply's mount path is authoritative; fall back to
                // the request's path for servers that omit it.
                if resp.mount_path.is_none() {
                    resp.mount_path = Some(request.mount_path().to_string());
                }
                let mount_path = resp.mount_path.clone().unwrap_or_default();
                self.ledger
                    .mark_success(
                        &key,
                        Some(&mount_path),
                        &encode(&resp)?,
                        resp.success_msg.as_deref().unwrap_or("mounted"),
                        true,
                    )
                    .await
                    .map_err(ledger_err)?;

                info!(key = %key, mount_path = %mount_path, "Mount succeeded");
                resp
            }
            Ok(resp) => {
                let msg = resp.error_msg.clone().unwrap_or_else(|| "mount failed".into());
                self.ledger
                    .mark_error(&key, &msg, &encode(&resp)?)
                    .await
                    .map_err(ledger_err)?;

                warn!(key = %key, error = %msg, "Mount rejected by server");
                resp
            }
            Err(e) => {
                // The request may still be in flight on the server; a
                // retry converges through server-side idempotence.
                let msg = format!("transport error: {e:#}");
                self.ledger
                    .mark_error(&key, &msg, "{}")
                    .await
                    .map_err(ledger_err)?;

                warn!(key = %key, error = %msg, "Mount call failed");
                MountResponse::error(msg)
            }
        };

        Ok(response)
    }

    // ------------------------------------------------------------------
    // Unmount
    // ------------------------------------------------------------------

    /// Release the binding described by `request`.
    ///
    /// The physical unmount is sent to the server only when this binding
    /// is the last active reference for (target, host); otherwise the
    /// release is ledger-only.
    pub async fn unmount(
        &self,
        mut request: MountRequest,
    ) -> Result<UnmountOutcome, CoordinatorError> {
        request.action = MountAction::Unmount;
        request.validate()?;
        let key = request.ledger_key();
        let request_blob = encode(&request)?;

        let _guard = self.lock.acquire().await?;

        let active = self
            .ledger
            .count_active(&key.target_id, &key.host)
            .await
            .map_err(ledger_err)?;

        if active == 0 {
            info!(key = %key, "Unmount is a no-op: no active bindings");
            return Ok(UnmountOutcome {
                status: ResponseStatus::Success,
                physically_unmounted: false,
                remaining: 0,
                message: "no active bindings; nothing to unmount".into(),
            });
        }

        let entry = self.ledger.get_by_key(&key).await.map_err(ledger_err)?;
        let ours_is_active = entry.as_ref().map(LedgerEntry::is_active).unwrap_or(false);

        if !ours_is_active {
            // Some other job holds the mount; this job has nothing to
            // release.
            info!(key = %key, active, "Unmount is a no-op: requesting job holds no active binding");
            return Ok(UnmountOutcome {
                status: ResponseStatus::Success,
                physically_unmounted: false,
                remaining: active,
                message: "requesting job holds no active binding".into(),
            });
        }

        if active > 1 {
            // Other jobs still reference the mount: release only the
            // ledger entry, never touch the kernel state.
            self.ledger
                .upsert_pending(&key, LastAction::Unmount, &request_blob)
                .await
                .map_err(ledger_err)?;
            let mount_path = entry.as_ref().and_then(|e| e.mount_path.clone());
            self.ledger
                .mark_success(
                    &key,
                    mount_path.as_deref(),
                    "{}",
                    "reference released; physical mount retained",
                    false,
                )
                .await
                .map_err(ledger_err)?;

            let remaining = active - 1;
            info!(key = %key, remaining, "Released reference; physical mount retained");
            return Ok(UnmountOutcome {
                status: ResponseStatus::Success,
                physically_unmounted: false,
                remaining,
                message: format!(
                    "reference released; physical mount retained ({remaining} other jobs active)"
                ),
            });
        }

        // Last reference and it is ours: perform the physical unmount.
        self.ledger
            .upsert_pending(&key, LastAction::Unmount, &request_blob)
            .await
            .map_err(ledger_err)?;

        match self.transport.call(&request).await {
            Ok(resp) if resp.is_success() => {
                self.ledger
                    .mark_success(
                        &key,
                        resp.mount_path.as_deref().or(Some(request.mount_path())),
                        &encode(&resp)?,
                        resp.success_msg.as_deref().unwrap_or("unmounted"),
                        false,
                    )
                    .await
                    .map_err(ledger_err)?;

                info!(key = %key, "Physical unmount succeeded");
                Ok(UnmountOutcome {
                    status: ResponseStatus::Success,
                    physically_unmounted: true,
                    remaining: 0,
                    message: "last reference released; target unmounted".into(),
                })
            }
            Ok(resp) => {
                let msg = resp
                    .error_msg
                    .clone()
                    .unwrap_or_else(|| "unmount failed".into());
                self.ledger
                    .mark_error(&key, &msg, &encode(&resp)?)
                    .await
                    .map_err(ledger_err)?;

                warn!(key = %key, error = %msg, "Unmount rejected by server");
                Ok(UnmountOutcome {
                    status: ResponseStatus::Error,
                    physically_unmounted: false,
                    remaining: active,
                    message: msg,
                })
            }
            Err(e) => {
                let msg = format!("transport error: {e:#}");
                self.ledger
                    .mark_error(&key, &msg, "{}")
                    .await
                    .map_err(ledger_err)?;

                warn!(key = %key, error = %msg, "Unmount call failed");
                Ok(UnmountOutcome {
                    status: ResponseStatus::Error,
                    physically_unmounted: false,
                    remaining: active,
                    message: msg,
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Scoped mount
    // ------------------------------------------------------------------

    /// Mount, run `body` with the mount path, and always unmount.
    ///
    /// The unmount runs on both the normal and the error exit of `body`,
    /// and an unmount failure is logged rather than masking the body's
    /// outcome.
    pub async fn with_mount<F, Fut, R>(
        &self,
        request: MountRequest,
        body: F,
    ) -> anyhow::Result<R>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let response = self.mount(request.clone()).await?;
        if !response.is_success() {
            anyhow::bail!(
                "mount failed: {}",
                response.error_msg.as_deref().unwrap_or("unknown error")
            );
        }
        let mount_path = response
            .mount_path
            .unwrap_or_else(|| request.mount_path().to_string());

        let result = body(mount_path).await;

        match self.unmount(request).await {
            Ok(outcome) if outcome.status == ResponseStatus::Error => {
                warn!(error = %outcome.message, "Unmount after scoped body reported an error");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Unmount after scoped body failed");
            }
        }

        result
    }

    // ------------------------------------------------------------------
    // Queries (run without the host lock)
    // ------------------------------------------------------------------

    /// Current ledger entry for a binding, if any.
    pub async fn status(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>, CoordinatorError> {
        self.ledger.get_by_key(key).await.map_err(ledger_err)
    }

    /// Active bindings matching the filter.
    pub async fn list_active(
        &self,
        filter: &LedgerFilter,
    ) -> Result<Vec<LedgerEntry>, CoordinatorError> {
        self.ledger.list_active(filter).await.map_err(ledger_err)
    }

    /// Ledger history for a target, newest first.
    pub async fn history(
        &self,
        target_id: &dms_core::domain::TargetId,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>, CoordinatorError> {
        self.ledger
            .history_by_target(target_id, limit)
            .await
            .map_err(ledger_err)
    }

    /// Retire a binding's ledger row. Returns whether a row was affected.
    pub async fn soft_delete(&self, key: &LedgerKey) -> Result<bool, CoordinatorError> {
        self.ledger.soft_delete(key).await.map_err(ledger_err)
    }
}

fn ledger_err(e: anyhow::Error) -> CoordinatorError {
    CoordinatorError::Ledger(format!("{e:#}"))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, CoordinatorError> {
    serde_json::to_string(value).map_err(|e| CoordinatorError::Internal(e.to_string()))
}
