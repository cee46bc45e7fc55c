//! DMS Ledger - Durable mount binding storage
//!
//! SQLite-backed ledger of (job, target, host) bindings. The ledger is
//! owned exclusively by coordinator processes; the per-node servers never
//! read or write it.
//!
//! ## Architecture
//!
//! This crate implements the `IMountLedger` port from `dms-core` using
//! SQLite as the storage backend. It is a driven (secondary) adapter.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with migration support
//! - [`SqliteMountLedger`] - Full `IMountLedger` implementation
//! - [`LedgerError`] - Error types for ledger operations

pub mod pool;
pub mod repository;

pub use pool::DatabasePool;
pub use repository::SqliteMountLedger;

/// Errors that can occur during ledger operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A stored value could not be mapped back to a domain type
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// No live row exists for the requested logical key
    #[error("No live ledger row for {0}")]
    RowNotFound(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::QueryFailed(e.to_string())
    }
}
