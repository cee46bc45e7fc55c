//! Host-scoped mount/unmount lock
//!
//! A single advisory file lock per host serializes every coordinator
//! decision on that host, across processes. The lock file is created on
//! first use and never deleted (deleting it would open a window where two
//! processes lock different inodes). The kernel drops the lock if the
//! holding process dies, so a crashed coordinator cannot wedge the host.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// File name of the host lock inside the configured lock directory.
pub const LOCK_FILE_NAME: &str = "mount_unmount.lock";

/// Interval between acquisition attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors from lock acquisition
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock was not acquired within the configured budget
    #[error("Could not acquire host lock within {0} seconds")]
    Timeout(u64),

    /// Opening or locking the lock file failed
    #[error("Lock file I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Host-scoped exclusive lock with a bounded acquisition timeout.
#[derive(Debug, Clone)]
pub struct HostLock {
    path: PathBuf,
    timeout: Duration,
}

impl HostLock {
    /// Create a lock handle rooted in `lock_dir`.
    ///
    /// The directory is created if missing; the lock file itself is
    /// created lazily on first acquisition.
    pub fn new(lock_dir: &Path, timeout: Duration) -> Result<Self, LockError> {
        std::fs::create_dir_all(lock_dir)?;
        Ok(Self {
            path: lock_dir.join(LOCK_FILE_NAME),
            timeout,
        })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, polling until success or timeout.
    ///
    /// The returned guard releases on drop. Acquisition never blocks the
    /// executor: each attempt is a non-blocking `flock`, with an async
    /// sleep between attempts.
    pub async fn acquire(&self) -> Result<HostLockGuard, LockError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;

        let start = Instant::now();
        loop {
            if try_flock_exclusive(&file)? {
                debug!(path = %self.path.display(), "Acquired host lock");
                return Ok(HostLockGuard { file, path: self.path.clone() });
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Err(LockError::Timeout(self.timeout.as_secs()));
            }

            debug!(
                path = %self.path.display(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Waiting for host lock"
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// RAII guard for the host lock; unlocks on drop.
#[derive(Debug)]
pub struct HostLockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for HostLockGuard {
    fn drop(&mut self) {
        // Closing the fd would release the lock anyway; the explicit
        // unlock keeps the release visible in strace and logs.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            warn!(
                path = %self.path.display(),
                error = %io::Error::last_os_error(),
                "Failed to release host lock explicitly"
            );
        } else {
            debug!(path = %self.path.display(), "Released host lock");
        }
    }
}

/// Try to take an exclusive flock on `file` without blocking.
///
/// Returns `Ok(true)` on acquisition, `Ok(false)` if another holder has
/// the lock.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_in(dir: &Path, timeout_ms: u64) -> HostLock {
        HostLock::new(dir, Duration::from_millis(timeout_ms)).unwrap()
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path(), 1000);

        let guard = lock.acquire().await.unwrap();
        assert!(lock.path().exists());
        drop(guard);

        // Re-acquirable after release.
        let _guard = lock.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn lock_file_is_never_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path(), 1000);
        drop(lock.acquire().await.unwrap());
        assert!(dir.path().join(LOCK_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn contended_acquire_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let holder = lock_in(dir.path(), 1000);
        let _held = holder.acquire().await.unwrap();

        // A second handle (separate open file description) must block
        // and then time out.
        let contender = lock_in(dir.path(), 300);
        let start = std::time::Instant::now();
        let err = contender.acquire().await.unwrap_err();
        assert!(matches!(err, LockError::Timeout(_)));
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn released_lock_unblocks_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let first = lock_in(dir.path(), 1000);
        let guard = first.acquire().await.unwrap();

        let second = lock_in(dir.path(), 2000);
        let waiter = tokio::spawn(async move { second.acquire().await });

        tokio::time::sleep(Duration::from_millis(250)).await;
        drop(guard);

        let acquired = waiter.await.unwrap();
        assert!(acquired.is_ok());
    }
}
