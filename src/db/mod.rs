// db/mod.rs - Database module with SQLx integration

pub mod migrations;

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Database abstraction with connection pooling
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Create new database connection with migrations
    ///
    /// Uses WAL mode for better concurrency and enables foreign keys so
    /// the atomic apply sees the same constraints the application does.
    pub async fn new(db_path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}", db_path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        migrations::run(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory database for tests and ephemeral use.
    ///
    /// Pinned to a single pooled connection that is never recycled; each
    /// new in-memory connection would otherwise see an empty schema.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        migrations::run(&pool).await?;

        Ok(Self { pool })
    }

    /// Execute health check query
    pub async fn health_check(&self) -> Result<bool> {
        let result: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;

        Ok(result.0 == 1)
    }
}

// Ensure pool is Send + Sync for cross-thread sharing
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn assert_all() {
        assert_send_sync::<Database>();
    }
};
