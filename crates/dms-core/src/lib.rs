//! DMS Core - Domain model and business rules
//!
//! This crate contains the shared core of the Dynamic Mount Service:
//! - Domain entities (MountRequest, BackupTarget, LedgerEntry)
//! - Port definitions (traits implemented by the adapter crates)
//! - Typed configuration with file and environment loading

pub mod config;
pub mod domain;
pub mod ports;
