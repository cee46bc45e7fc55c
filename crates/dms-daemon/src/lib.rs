//! DMS Daemon - Per-node mount server
//!
//! The daemon owns everything node-local: the long-lived FUSE helper
//! processes for S3 targets, the kernel mount state for NFS targets, and
//! the secret store client. It consumes mount/unmount requests from the
//! node's broker queue one at a time and is the only writer of the pid
//! registry on this host.
//!
//! ## Key Components
//!
//! - [`registry::FuseProcessRegistry`] - Dual memory + pid-file tracking
//!   of FUSE helpers, surviving daemon restarts
//! - [`executor::MountExecutor`] - Drives mounts/unmounts per target kind
//! - [`secrets::HttpSecretProvider`] - Secret store client
//! - [`handler::MountHandler`] - Maps requests to executor calls

pub mod executor;
pub mod handler;
pub mod mounts;
pub mod registry;
pub mod secrets;
