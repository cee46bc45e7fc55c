//! FUSE helper process registry
//!
//! Owns the long-lived FUSE helper processes, one per mounted S3 target
//! on this host. Every helper is tracked twice: in a memory index for
//! fast lookups and in a pid file (`<pid_dir>/<target_id>.pid`) that
//! survives daemon restarts. Every mutating operation updates memory and
//! disk before returning; recovery reads disk and repopulates memory.
//!
//! Helpers are spawned into their own process group with detached stdio,
//! so killing the daemon never kills a mount.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, Pid};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dms_core::domain::TargetId;

/// Interval between mount-readiness probes after a spawn.
const READINESS_POLL: Duration = Duration::from_millis(500);

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(10);

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Pid file or mount directory I/O failed
    #[error("Registry I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The helper could not be started or died immediately
    #[error("Failed to spawn FUSE helper: {0}")]
    Spawn(String),

    /// The helper started but its mount never appeared
    #[error("Helper for target {target} not ready at {mount_path} within {timeout_secs}s")]
    NotReady {
        target: String,
        mount_path: String,
        timeout_secs: u64,
    },
}

/// How a tracked process entered the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSource {
    /// Spawned by this daemon process
    Spawned,
    /// Adopted from a pid file written by a previous daemon process
    LoadedFromDisk,
}

/// One tracked FUSE helper
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub target_id: TargetId,
    pub pid: i32,
    pub mount_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub env_keys: Vec<String>,
    pub source: ProcessSource,
}

/// Dual memory + pid-file registry of FUSE helper processes.
pub struct FuseProcessRegistry {
    binary: PathBuf,
    pid_dir: PathBuf,
    readiness_timeout: Duration,
    /// Fast index; authoritative between restarts
    processes: DashMap<String, ProcessRecord>,
    /// Child handles for processes we spawned, kept for reaping
    children: DashMap<String, Child>,
    /// Per-target guards serializing concurrent spawns
    spawn_guards: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl FuseProcessRegistry {
    /// Create a registry rooted at `pid_dir`, creating the directory if
    /// needed.
    pub fn new(
        binary: impl Into<PathBuf>,
        pid_dir: impl Into<PathBuf>,
        readiness_timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let pid_dir = pid_dir.into();
        std::fs::create_dir_all(&pid_dir)?;

        Ok(Self {
            binary: binary.into(),
            pid_dir,
            readiness_timeout,
            processes: DashMap::new(),
            children: DashMap::new(),
            spawn_guards: DashMap::new(),
        })
    }

    // ------------------------------------------------------------------
    // Spawn
    // ------------------------------------------------------------------

    /// Ensure a helper is running for `target_id` at `mount_path`.
    ///
    /// Idempotent: a live helper (in memory or adopted from a pid file)
    /// short-circuits to success. Concurrent spawns for the same target
    /// serialize on a per-target guard; the second caller observes the
    /// first one's result.
    pub async fn spawn(
        &self,
        target_id: &TargetId,
        mount_path: &Path,
        env: &HashMap<String, String>,
    ) -> Result<(), RegistryError> {
        let guard = self
            .spawn_guards
            .entry(target_id.as_str().to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _serialized = guard.lock().await;

        // Memory first.
        if let Some(record) = self.processes.get(target_id.as_str()) {
            let pid = record.pid;
            drop(record);
            if process_alive(pid) {
                debug!(target_id = %target_id, pid, "Helper already running (memory)");
                return Ok(());
            }
            warn!(target_id = %target_id, pid, "Purging dead helper entry");
            self.forget(target_id)?;
        }

        // Then disk.
        if let Some(pid) = self.read_pid_file(target_id)? {
            if process_alive(pid) {
                info!(target_id = %target_id, pid, "Adopting running helper from pid file");
                self.processes.insert(
                    target_id.as_str().to_string(),
                    ProcessRecord {
                        target_id: target_id.clone(),
                        pid,
                        mount_path: Some(mount_path.to_path_buf()),
                        started_at: Utc::now(),
                        env_keys: Vec::new(),
                        source: ProcessSource::LoadedFromDisk,
                    },
                );
                return Ok(());
            }
            debug!(target_id = %target_id, pid, "Removing stale pid file");
            self.delete_pid_file(target_id)?;
        }

        std::fs::create_dir_all(mount_path)?;

        let mut child = Command::new(&self.binary)
            .arg(mount_path)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| RegistryError::Spawn(format!("{}: {e}", self.binary.display())))?;

        let pid = child
            .id()
            .ok_or_else(|| RegistryError::Spawn("helper exited before it was tracked".into()))?
            as i32;

        info!(target_id = %target_id, pid, mount_path = %mount_path.display(), "Spawned FUSE helper");

        // Wait for the mount to appear in the kernel table.
        let deadline = Instant::now() + self.readiness_timeout;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(RegistryError::Spawn(format!(
                    "helper exited during startup with {status}"
                )));
            }
            if crate::mounts::is_mount_point(mount_path)? {
                break;
            }
            if Instant::now() >= deadline {
                warn!(target_id = %target_id, pid, "Helper not ready in time, killing it");
                let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
                let _ = child.wait().await;
                self.delete_pid_file(target_id)?;
                return Err(RegistryError::NotReady {
                    target: target_id.to_string(),
                    mount_path: mount_path.display().to_string(),
                    timeout_secs: self.readiness_timeout.as_secs(),
                });
            }
            tokio::time::sleep(READINESS_POLL).await;
        }

        // Record in memory, then on disk; both complete before returning.
        let mut env_keys: Vec<String> = env.keys().cloned().collect();
        env_keys.sort();
        self.processes.insert(
            target_id.as_str().to_string(),
            ProcessRecord {
                target_id: target_id.clone(),
                pid,
                mount_path: Some(mount_path.to_path_buf()),
                started_at: Utc::now(),
                env_keys,
                source: ProcessSource::Spawned,
            },
        );
        self.children.insert(target_id.as_str().to_string(), child);
        self.write_pid_file(target_id, pid)?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Kill
    // ------------------------------------------------------------------

    /// Stop the helper for `target_id` and drop it from both indexes.
    ///
    /// SIGTERM first, SIGKILL after a grace period (immediately when
    /// `force` is set). A target with no live helper is a success: the
    /// pid file is cleaned up regardless.
    pub async fn kill(&self, target_id: &TargetId, force: bool) -> Result<(), RegistryError> {
        let pid = match self.processes.get(target_id.as_str()) {
            Some(record) => Some(record.pid),
            None => self.read_pid_file(target_id)?,
        };

        let Some(pid) = pid else {
            debug!(target_id = %target_id, "No helper tracked; nothing to kill");
            self.forget(target_id)?;
            return Ok(());
        };

        if !process_alive(pid) {
            info!(target_id = %target_id, pid, "Helper already terminated");
            self.reap(target_id).await;
            self.forget(target_id)?;
            return Ok(());
        }

        info!(target_id = %target_id, pid, force, "Stopping FUSE helper");

        if force {
            signal_process(pid, Signal::SIGKILL);
        } else {
            signal_process(pid, Signal::SIGTERM);

            let deadline = Instant::now() + TERM_GRACE;
            while process_alive(pid) && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            if process_alive(pid) {
                warn!(target_id = %target_id, pid, "Helper ignored SIGTERM, sending SIGKILL");
                signal_process(pid, Signal::SIGKILL);
            }
        }

        self.reap(target_id).await;
        self.forget(target_id)?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries and maintenance
    // ------------------------------------------------------------------

    /// Whether a live helper exists for `target_id`.
    ///
    /// Checks memory first; falls back to the pid file and hydrates the
    /// memory index when a live process is found there.
    pub fn is_running(&self, target_id: &TargetId) -> bool {
        if let Some(record) = self.processes.get(target_id.as_str()) {
            if process_alive(record.pid) {
                return true;
            }
        }

        match self.read_pid_file(target_id) {
            Ok(Some(pid)) if process_alive(pid) => {
                info!(target_id = %target_id, pid, "Hydrating helper entry from pid file");
                self.processes.insert(
                    target_id.as_str().to_string(),
                    ProcessRecord {
                        target_id: target_id.clone(),
                        pid,
                        mount_path: None,
                        started_at: Utc::now(),
                        env_keys: Vec::new(),
                        source: ProcessSource::LoadedFromDisk,
                    },
                );
                true
            }
            _ => false,
        }
    }

    /// Snapshot of the tracked record for `target_id`, if any.
    pub fn get(&self, target_id: &TargetId) -> Option<ProcessRecord> {
        self.processes
            .get(target_id.as_str())
            .map(|r| r.value().clone())
    }

    /// Snapshot of all tracked records.
    pub fn list(&self) -> Vec<ProcessRecord> {
        self.processes.iter().map(|r| r.value().clone()).collect()
    }

    /// Adopt live helpers from pid files on startup; delete stale files.
    ///
    /// Returns `(adopted, cleaned)` counts.
    pub fn load_existing(&self) -> Result<(usize, usize), RegistryError> {
        let mut adopted = 0;
        let mut cleaned = 0;

        for entry in std::fs::read_dir(&self.pid_dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = pid_file_stem(&path) else {
                continue;
            };
            let Ok(target_id) = TargetId::new(stem) else {
                warn!(path = %path.display(), "Skipping pid file with invalid target id");
                continue;
            };

            let Some(pid) = self.read_pid_file(&target_id)? else {
                // Unreadable or garbled; treat as stale.
                std::fs::remove_file(&path)?;
                cleaned += 1;
                continue;
            };

            if process_alive(pid) {
                info!(target_id = %target_id, pid, "Adopted helper from previous daemon run");
                self.processes.insert(
                    target_id.as_str().to_string(),
                    ProcessRecord {
                        target_id: target_id.clone(),
                        pid,
                        mount_path: None,
                        started_at: Utc::now(),
                        env_keys: Vec::new(),
                        source: ProcessSource::LoadedFromDisk,
                    },
                );
                adopted += 1;
            } else {
                info!(target_id = %target_id, pid, "Deleting stale pid file");
                std::fs::remove_file(&path)?;
                cleaned += 1;
            }
        }

        info!(adopted, cleaned, pid_dir = %self.pid_dir.display(), "Pid file scan complete");
        Ok((adopted, cleaned))
    }

    /// Drop every memory entry whose process died, deleting its pid
    /// file. Returns the number of entries removed.
    pub async fn cleanup_dead(&self) -> Result<usize, RegistryError> {
        let dead: Vec<String> = self
            .processes
            .iter()
            .filter(|r| !process_alive(r.value().pid))
            .map(|r| r.key().clone())
            .collect();

        for key in &dead {
            // Registry keys originate from validated target ids.
            let Ok(target_id) = TargetId::new(key.clone()) else {
                continue;
            };
            info!(target_id = %target_id, "Cleaning up dead helper entry");
            self.reap(&target_id).await;
            self.forget(&target_id)?;
        }

        Ok(dead.len())
    }

    // ------------------------------------------------------------------
    // Pid file plumbing
    // ------------------------------------------------------------------

    fn pid_file_path(&self, target_id: &TargetId) -> PathBuf {
        self.pid_dir.join(format!("{}.pid", target_id.as_str()))
    }

    /// Read and parse the pid file; `Ok(None)` means not tracked on disk
    /// or unreadable content.
    fn read_pid_file(&self, target_id: &TargetId) -> Result<Option<i32>, RegistryError> {
        let path = self.pid_file_path(target_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match content.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid)),
            _ => {
                warn!(path = %path.display(), "Pid file content is not a pid");
                Ok(None)
            }
        }
    }

    /// Write the pid file atomically (write to a temp name, then rename).
    fn write_pid_file(&self, target_id: &TargetId, pid: i32) -> Result<(), RegistryError> {
        let path = self.pid_file_path(target_id);
        let tmp = path.with_extension("pid.tmp");
        std::fs::write(&tmp, format!("{pid}\n"))?;
        std::fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), pid, "Wrote pid file");
        Ok(())
    }

    fn delete_pid_file(&self, target_id: &TargetId) -> Result<(), RegistryError> {
        let path = self.pid_file_path(target_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Deleted pid file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a target from memory and disk.
    fn forget(&self, target_id: &TargetId) -> Result<(), RegistryError> {
        self.processes.remove(target_id.as_str());
        self.children.remove(target_id.as_str());
        self.delete_pid_file(target_id)
    }

    /// Reap the child handle if we spawned this helper ourselves, so a
    /// terminated helper does not linger as a zombie.
    async fn reap(&self, target_id: &TargetId) {
        if let Some((_, mut child)) = self.children.remove(target_id.as_str()) {
            let _ = child.wait().await;
        }
    }
}

// ============================================================================
// Process helpers
// ============================================================================

/// Liveness probe via `kill(pid, 0)`.
///
/// EPERM means the process exists but belongs to someone else; treat it
/// as alive. Zombies are dead for our purposes: their mount is gone.
pub(crate) fn process_alive(pid: i32) -> bool {
    let rc = unsafe { libc::kill(pid, 0) };
    if rc != 0 {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return errno == libc::EPERM;
    }
    !is_zombie(pid)
}

/// Whether `/proc/<pid>/stat` reports the process as a zombie.
///
/// The state field follows the parenthesized command name; comm names
/// may themselves contain ')', so split on the last one.
fn is_zombie(pid: i32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    stat.rsplit_once(')')
        .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        .unwrap_or(false)
}

/// Signal the helper's process group, falling back to the single pid
/// for adopted processes whose group is unknown.
fn signal_process(pid: i32, sig: Signal) {
    let target = Pid::from_raw(pid);
    match getpgid(Some(target)) {
        Ok(pgid) if pgid.as_raw() > 1 => {
            if killpg(pgid, sig).is_err() {
                let _ = kill(target, sig);
            }
        }
        _ => {
            let _ = kill(target, sig);
        }
    }
}

/// Target id stem of a `*.pid` path, if it is one.
fn pid_file_stem(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(".pid")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id() as i32));
    }

    #[test]
    fn nonexistent_pid_is_dead() {
        // Pid 0 signals the caller's group; use an id outside pid_max.
        assert!(!process_alive(i32::MAX - 1));
    }

    #[test]
    fn pid_file_stem_extraction() {
        assert_eq!(
            pid_file_stem(Path::new("/run/dms/s3/tgt-A.pid")),
            Some("tgt-A")
        );
        assert_eq!(pid_file_stem(Path::new("/run/dms/s3/tgt-A.tmp")), None);
        assert_eq!(pid_file_stem(Path::new("/run/dms/s3/noext")), None);
    }
}
