//! Integration tests for the mount coordinator
//!
//! These exercise the reference-counting protocol against a real
//! in-memory ledger and a scripted transport double, covering the
//! shared-mount, out-of-order release, lock timeout, and lost-reply
//! scenarios.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dms_client::{CoordinatorError, HostLock, MountCoordinator};
use dms_core::domain::{
    BackupTarget, HostName, JobId, JobRef, LastStatus, LedgerKey, MountAction, MountRequest,
    MountResponse, RequestContext, ResponseStatus, TargetId, TargetKind, TargetStatus,
};
use dms_core::ports::{IMountLedger, IMountTransport, LedgerFilter};
use dms_ledger::{DatabasePool, SqliteMountLedger};

// ============================================================================
// Transport double
// ============================================================================

/// Scripted transport: replays queued replies, then echoes success.
struct MockTransport {
    calls: Mutex<Vec<MountRequest>>,
    script: Mutex<VecDeque<Result<MountResponse, String>>>,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
        })
    }

    fn push_reply(&self, reply: Result<MountResponse, String>) {
        self.script.lock().unwrap().push_back(reply);
    }

    fn calls(&self) -> Vec<MountRequest> {
        self.calls.lock().unwrap().clone()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl IMountTransport for MockTransport {
    async fn call(&self, request: &MountRequest) -> anyhow::Result<MountResponse> {
        self.calls.lock().unwrap().push(request.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(resp)) => Ok(resp),
            Some(Err(msg)) => Err(anyhow::anyhow!(msg)),
            None => Ok(MountResponse::success(
                format!("{} ok", request.action),
                request.mount_path().to_string(),
            )),
        }
    }
}

// ============================================================================
// Fixtures
// ============================================================================

struct Fixture {
    coordinator: MountCoordinator,
    ledger: Arc<SqliteMountLedger>,
    transport: Arc<MockTransport>,
    _lock_dir: tempfile::TempDir,
}

async fn setup() -> Fixture {
    setup_with_lock_timeout(Duration::from_secs(5)).await
}

async fn setup_with_lock_timeout(timeout: Duration) -> Fixture {
    let pool = DatabasePool::in_memory().await.unwrap();
    let ledger = Arc::new(SqliteMountLedger::new(pool.pool().clone()));
    let transport = MockTransport::new();
    let lock_dir = tempfile::tempdir().unwrap();
    let lock = HostLock::new(lock_dir.path(), timeout).unwrap();

    Fixture {
        coordinator: MountCoordinator::new(ledger.clone(), transport.clone(), lock),
        ledger,
        transport,
        _lock_dir: lock_dir,
    }
}

fn request(job: i64, target: &str, host: &str, mount_path: &str) -> MountRequest {
    MountRequest {
        context: RequestContext::default(),
        token: Some("token-abc".into()),
        job: JobRef {
            id: JobId::new(job),
            action: Some("backup".into()),
        },
        host: HostName::new(host).unwrap(),
        action: MountAction::Mount,
        backup_target: BackupTarget {
            id: TargetId::new(target).unwrap(),
            kind: TargetKind::S3,
            filesystem_export: None,
            filesystem_export_mount_path: mount_path.into(),
            secret_ref: Some("https://secrets.example/v1/secrets/abc".into()),
            nfs_mount_opts: None,
            status: TargetStatus::Available,
            deleted: false,
        },
    }
}

fn ledger_key(job: i64, target: &str, host: &str) -> LedgerKey {
    LedgerKey {
        job_id: JobId::new(job),
        target_id: TargetId::new(target).unwrap(),
        host: HostName::new(host).unwrap(),
    }
}

// ============================================================================
// Scenario: single mount
// ============================================================================

#[tokio::test]
async fn single_mount_creates_one_active_binding() {
    let fx = setup().await;

    let resp = fx
        .coordinator
        .mount(request(1001, "tgt-A", "h1", "/m/A"))
        .await
        .unwrap();

    assert!(resp.is_success());
    assert_eq!(resp.mount_path.as_deref(), Some("/m/A"));

    let target = TargetId::new("tgt-A").unwrap();
    let host = HostName::new("h1").unwrap();
    assert_eq!(fx.ledger.count_active(&target, &host).await.unwrap(), 1);

    let entry = fx
        .ledger
        .get_by_key(&ledger_key(1001, "tgt-A", "h1"))
        .await
        .unwrap()
        .unwrap();
    assert!(entry.mounted);
    assert_eq!(entry.status_last, LastStatus::Success);
    assert_eq!(entry.mount_path.as_deref(), Some("/m/A"));

    // Exactly one RPC, with action=mount.
    let calls = fx.transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, MountAction::Mount);
}

// ============================================================================
// Scenario: shared mount, release in order
// ============================================================================

#[tokio::test]
async fn shared_mount_physically_unmounts_on_last_release() {
    let fx = setup().await;

    for job in [1001, 1002, 1003] {
        let resp = fx
            .coordinator
            .mount(request(job, "tgt-A", "h1", "/m/A"))
            .await
            .unwrap();
        assert!(resp.is_success());
    }
    assert_eq!(fx.transport.call_count(), 3);

    // First two releases are ledger-only.
    let out = fx
        .coordinator
        .unmount(request(1001, "tgt-A", "h1", "/m/A"))
        .await
        .unwrap();
    assert!(!out.physically_unmounted);
    assert_eq!(out.remaining, 2);
    assert_eq!(fx.transport.call_count(), 3, "no RPC for a shared release");

    let out = fx
        .coordinator
        .unmount(request(1002, "tgt-A", "h1", "/m/A"))
        .await
        .unwrap();
    assert!(!out.physically_unmounted);
    assert_eq!(out.remaining, 1);

    // The last release triggers the physical unmount.
    let out = fx
        .coordinator
        .unmount(request(1003, "tgt-A", "h1", "/m/A"))
        .await
        .unwrap();
    assert!(out.physically_unmounted);
    assert_eq!(out.remaining, 0);
    assert_eq!(out.status, ResponseStatus::Success);

    let calls = fx.transport.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[3].action, MountAction::Unmount);
    assert_eq!(calls[3].job.id, JobId::new(1003));

    let target = TargetId::new("tgt-A").unwrap();
    let host = HostName::new("h1").unwrap();
    assert_eq!(fx.ledger.count_active(&target, &host).await.unwrap(), 0);
}

// ============================================================================
// Scenario: out-of-order release
// ============================================================================

#[tokio::test]
async fn out_of_order_release_converges() {
    let fx = setup().await;

    for job in [2001, 2002] {
        fx.coordinator
            .mount(request(job, "tgt-B", "h1", "/m/B"))
            .await
            .unwrap();
    }

    // 2002 releases first: ledger-only.
    let out = fx
        .coordinator
        .unmount(request(2002, "tgt-B", "h1", "/m/B"))
        .await
        .unwrap();
    assert!(!out.physically_unmounted);
    assert_eq!(out.remaining, 1);
    assert_eq!(fx.transport.call_count(), 2);

    let e2002 = fx
        .ledger
        .get_by_key(&ledger_key(2002, "tgt-B", "h1"))
        .await
        .unwrap()
        .unwrap();
    assert!(!e2002.mounted);

    // 2001 releases last: physical unmount.
    let out = fx
        .coordinator
        .unmount(request(2001, "tgt-B", "h1", "/m/B"))
        .await
        .unwrap();
    assert!(out.physically_unmounted);
    assert_eq!(out.remaining, 0);
    assert_eq!(fx.transport.call_count(), 3);

    let e2001 = fx
        .ledger
        .get_by_key(&ledger_key(2001, "tgt-B", "h1"))
        .await
        .unwrap()
        .unwrap();
    assert!(!e2001.mounted);
}

// ============================================================================
// Scenario: lock timeout
// ============================================================================

#[tokio::test]
async fn lock_timeout_leaves_ledger_untouched() {
    let fx = setup_with_lock_timeout(Duration::from_millis(300)).await;

    // Hold the host lock from "another process".
    let holder = HostLock::new(fx._lock_dir.path(), Duration::from_secs(1)).unwrap();
    let _held = holder.acquire().await.unwrap();

    let err = fx
        .coordinator
        .mount(request(1001, "tgt-A", "h1", "/m/A"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Lock(_)));

    // Nothing was recorded and no RPC went out.
    assert!(fx
        .ledger
        .get_by_key(&ledger_key(1001, "tgt-A", "h1"))
        .await
        .unwrap()
        .is_none());
    assert_eq!(fx.transport.call_count(), 0);
}

// ============================================================================
// Scenario: lost reply, then retry
// ============================================================================

#[tokio::test]
async fn lost_reply_converges_on_retry() {
    let fx = setup().await;
    fx.transport
        .push_reply(Err("No reply within 60 seconds".into()));

    // First attempt: transport error recorded in the ledger.
    let resp = fx
        .coordinator
        .mount(request(1001, "tgt-A", "h1", "/m/A"))
        .await
        .unwrap();
    assert!(!resp.is_success());

    let entry = fx
        .ledger
        .get_by_key(&ledger_key(1001, "tgt-A", "h1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status_last, LastStatus::Error);
    assert!(!entry.mounted);
    assert!(entry.error_msg.unwrap().contains("transport error"));

    // Retry: the server (already mounted) answers success and the ledger
    // converges to mounted=true on the same row.
    let resp = fx
        .coordinator
        .mount(request(1001, "tgt-A", "h1", "/m/A"))
        .await
        .unwrap();
    assert!(resp.is_success());

    let entry = fx
        .ledger
        .get_by_key(&ledger_key(1001, "tgt-A", "h1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status_last, LastStatus::Success);
    assert!(entry.mounted);

    let target = TargetId::new("tgt-A").unwrap();
    let host = HostName::new("h1").unwrap();
    assert_eq!(fx.ledger.count_active(&target, &host).await.unwrap(), 1);
}

// ============================================================================
// Idempotence and edge cases
// ============================================================================

#[tokio::test]
async fn repeated_mount_is_idempotent() {
    let fx = setup().await;

    for _ in 0..2 {
        let resp = fx
            .coordinator
            .mount(request(1001, "tgt-A", "h1", "/m/A"))
            .await
            .unwrap();
        assert!(resp.is_success());
    }

    let target = TargetId::new("tgt-A").unwrap();
    let host = HostName::new("h1").unwrap();
    assert_eq!(fx.ledger.count_active(&target, &host).await.unwrap(), 1);

    // Still a single logical binding row.
    let history = fx.ledger.history_by_target(&target, 10).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn unmount_without_bindings_is_a_noop() {
    let fx = setup().await;

    let out = fx
        .coordinator
        .unmount(request(1001, "tgt-A", "h1", "/m/A"))
        .await
        .unwrap();
    assert_eq!(out.status, ResponseStatus::Success);
    assert!(!out.physically_unmounted);
    assert_eq!(out.remaining, 0);
    assert_eq!(fx.transport.call_count(), 0);
}

#[tokio::test]
async fn unmount_by_non_holder_leaves_mount_alone() {
    let fx = setup().await;
    fx.coordinator
        .mount(request(1001, "tgt-A", "h1", "/m/A"))
        .await
        .unwrap();

    // Job 9999 never mounted; its unmount must not disturb job 1001.
    let out = fx
        .coordinator
        .unmount(request(9999, "tgt-A", "h1", "/m/A"))
        .await
        .unwrap();
    assert!(!out.physically_unmounted);
    assert_eq!(out.remaining, 1);
    assert_eq!(fx.transport.call_count(), 1, "no unmount RPC");

    let target = TargetId::new("tgt-A").unwrap();
    let host = HostName::new("h1").unwrap();
    assert_eq!(fx.ledger.count_active(&target, &host).await.unwrap(), 1);
}

#[tokio::test]
async fn validation_failures_touch_nothing() {
    let fx = setup().await;

    let mut bad = request(1001, "tgt-A", "h1", "/m/A");
    bad.backup_target.secret_ref = None; // S3 requires a secret_ref

    let err = fx.coordinator.mount(bad).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Validation(_)));
    assert_eq!(fx.transport.call_count(), 0);
    assert!(fx
        .ledger
        .get_by_key(&ledger_key(1001, "tgt-A", "h1"))
        .await
        .unwrap()
        .is_none());
}

// ============================================================================
// Scoped mount
// ============================================================================

#[tokio::test]
async fn with_mount_releases_on_success() {
    let fx = setup().await;
    let seen_path = Arc::new(Mutex::new(String::new()));

    let seen = seen_path.clone();
    let result: anyhow::Result<u32> = fx
        .coordinator
        .with_mount(request(1001, "tgt-A", "h1", "/m/A"), move |path| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap() = path;
                Ok(42)
            }
        })
        .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(*seen_path.lock().unwrap(), "/m/A");

    // Released on exit.
    let target = TargetId::new("tgt-A").unwrap();
    let host = HostName::new("h1").unwrap();
    assert_eq!(fx.ledger.count_active(&target, &host).await.unwrap(), 0);

    let calls = fx.transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].action, MountAction::Unmount);
}

#[tokio::test]
async fn with_mount_releases_on_body_error() {
    let fx = setup().await;
    let body_runs = Arc::new(AtomicUsize::new(0));

    let runs = body_runs.clone();
    let result: anyhow::Result<()> = fx
        .coordinator
        .with_mount(request(1001, "tgt-A", "h1", "/m/A"), move |_path| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("backup exploded")
            }
        })
        .await;

    // The body's error is what the caller sees.
    let err = result.unwrap_err();
    assert!(err.to_string().contains("backup exploded"));
    assert_eq!(body_runs.load(Ordering::SeqCst), 1);

    // The mount was still released.
    let target = TargetId::new("tgt-A").unwrap();
    let host = HostName::new("h1").unwrap();
    assert_eq!(fx.ledger.count_active(&target, &host).await.unwrap(), 0);
}

#[tokio::test]
async fn with_mount_fails_fast_when_mount_fails() {
    let fx = setup().await;
    fx.transport
        .push_reply(Ok(MountResponse::error("target unavailable")));

    let result: anyhow::Result<()> = fx
        .coordinator
        .with_mount(request(1001, "tgt-A", "h1", "/m/A"), |_path| async move {
            panic!("body must not run when the mount fails")
        })
        .await;

    let err = result.unwrap_err();
    assert!(err.to_string().contains("target unavailable"));
    // Only the failed mount call went out; no unmount for a mount that
    // never happened.
    assert_eq!(fx.transport.call_count(), 1);
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn list_active_and_soft_delete_round_trip() {
    let fx = setup().await;
    fx.coordinator
        .mount(request(1001, "tgt-A", "h1", "/m/A"))
        .await
        .unwrap();
    fx.coordinator
        .mount(request(1002, "tgt-B", "h1", "/m/B"))
        .await
        .unwrap();

    let active = fx
        .coordinator
        .list_active(&LedgerFilter::new().with_host(HostName::new("h1").unwrap()))
        .await
        .unwrap();
    assert_eq!(active.len(), 2);

    let key = ledger_key(1001, "tgt-A", "h1");
    assert!(fx.coordinator.soft_delete(&key).await.unwrap());
    assert!(fx.coordinator.status(&key).await.unwrap().is_none());

    let active = fx.coordinator.list_active(&LedgerFilter::new()).await.unwrap();
    assert_eq!(active.len(), 1);
}
