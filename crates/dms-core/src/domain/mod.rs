//! Domain entities and business rules
//!
//! This module contains the core domain types for the mount service:
//! - Newtypes for type-safe, validated identifiers
//! - Backup target descriptions (S3 and NFS)
//! - Mount/unmount request and response shapes
//! - Ledger entries tracking (job, target, host) bindings
//! - Domain-specific error types

pub mod errors;
pub mod ledger;
pub mod newtypes;
pub mod request;
pub mod target;

// Re-export commonly used types
pub use errors::DomainError;
pub use ledger::{LastAction, LastStatus, LedgerEntry, LedgerKey};
pub use newtypes::{HostName, JobId, TargetId};
pub use request::{
    JobRef, MountAction, MountRequest, MountResponse, RequestContext, ResponseStatus,
};
pub use target::{BackupTarget, TargetKind, TargetStatus};
