//! Database layer with SQLite
//!
//! The collector writes into a private working store and republishes it as a
//! read-only snapshot file after every cycle.

use nwwatch_core::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use tracing::info;

pub mod models;
pub mod queries;
pub mod reader;
pub mod snapshot;

pub use models::*;
pub use reader::SnapshotReader;
pub use snapshot::{SnapshotPublisher, StoreSettings};

// Re-export sqlx types for convenience
pub use sqlx::{self, Pool as SqlxPool, Sqlite as SqlxSqlite};

// Embed migrations at compile time
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Database connection pool
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open (creating if needed) a writable database file
    ///
    /// A single connection is used: the working store has exactly one
    /// writer. Rollback journaling keeps published copies free of WAL
    /// side files.
    pub async fn open(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "Opening database");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                info!(dir = ?parent, "Creating database directory");
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::DatabaseError(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| Error::DatabaseError(format!("Failed to connect: {}", e)))?;

        Ok(Self { pool })
    }

    /// Open an existing database file without write access
    pub async fn open_read_only(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                Error::DatabaseError(format!("Failed to open {}: {}", path.display(), e))
            })?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations");

        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| Error::DatabaseError(format!("Failed to run migrations: {}", e)))?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Close the database connection
    pub async fn close(self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
