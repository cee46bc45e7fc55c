//! DMS Client - Reference-counted mount coordination
//!
//! The coordinator is linked into backup workloads and wraps the ledger,
//! the RPC transport, and a host-scoped file lock into the mount
//! protocol: mount at most once per (target, host), keep the mount alive
//! while any job references it, physically unmount exactly when the last
//! reference is released.
//!
//! ## Key Components
//!
//! - [`HostLock`] / [`HostLockGuard`] - Advisory cross-process lock
//!   serializing all mount/unmount decisions on one host
//! - [`MountCoordinator`] - The mount/unmount protocol plus the scoped
//!   [`MountCoordinator::with_mount`] helper

pub mod coordinator;
pub mod lock;

pub use coordinator::{CoordinatorError, MountCoordinator, UnmountOutcome};
pub use lock::{HostLock, HostLockGuard, LockError};
