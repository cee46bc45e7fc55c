//! Database connection pool management
//!
//! Provides a wrapper around SQLx's SqlitePool with:
//! - Automatic directory creation for database files
//! - WAL journal mode for concurrent reads
//! - Automatic schema migration on first connection
//! - In-memory mode for testing

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::LedgerError;

/// URL prefix accepted by [`DatabasePool::connect`].
const SQLITE_URL_PREFIX: &str = "sqlite://";

/// Manages a pool of SQLite connections for the mount ledger
///
/// The pool is configured with:
/// - WAL journal mode so status/list/history reads never block writers
/// - 5 max connections for file-based databases
/// - 1 connection for in-memory databases (required for data persistence)
/// - 5-second busy timeout to ride out cross-process write contention
#[derive(Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Creates a new database pool connected to the specified file
    ///
    /// This will:
    /// 1. Create parent directories if they don't exist
    /// 2. Create the database file if it doesn't exist
    /// 3. Enable WAL journal mode
    /// 4. Run schema migrations
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::ConnectionFailed` if the connection cannot be
    /// established, or `LedgerError::MigrationFailed` if migrations fail.
    pub async fn new(db_path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LedgerError::ConnectionFailed(format!(
                    "Failed to create ledger directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                LedgerError::ConnectionFailed(format!(
                    "Failed to connect to ledger at {}: {}",
                    db_path.display(),
                    e
                ))
            })?;

        Self::run_migrations(&pool).await?;

        tracing::info!(path = %db_path.display(), "Ledger pool initialized");

        Ok(Self { pool })
    }

    /// Creates a pool from a `sqlite://` URL as found in the
    /// `ledger.url` configuration key.
    pub async fn connect(url: &str) -> Result<Self, LedgerError> {
        let Some(path) = url.strip_prefix(SQLITE_URL_PREFIX) else {
            return Err(LedgerError::ConnectionFailed(format!(
                "unsupported ledger URL '{url}' (expected {SQLITE_URL_PREFIX}...)"
            )));
        };
        Self::new(Path::new(path)).await
    }

    /// Creates an in-memory database pool for testing
    ///
    /// Uses a single connection to ensure data persistence across queries
    /// (SQLite in-memory databases are per-connection).
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                LedgerError::ConnectionFailed(format!(
                    "Failed to create in-memory database: {}",
                    e
                ))
            })?;

        Self::run_migrations(&pool).await?;

        tracing::debug!("In-memory ledger pool initialized");

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying SQLite connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs the initial schema migration
    async fn run_migrations(pool: &SqlitePool) -> Result<(), LedgerError> {
        let migration_sql = include_str!("migrations/20260610_initial.sql");
        sqlx::raw_sql(migration_sql)
            .execute(pool)
            .await
            .map_err(|e| {
                LedgerError::MigrationFailed(format!("Failed to run initial migration: {}", e))
            })?;

        tracing::debug!("Ledger migrations completed");
        Ok(())
    }
}
