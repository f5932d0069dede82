// sync/watermark.rs - Last-sync watermark persistence

use sqlx::SqlitePool;

use crate::Result;

/// Key in `sync_state`; kept stable for compatibility with existing
/// deployments.
pub const WATERMARK_KEY: &str = "last_sync_timestamp";

/// Persists the unix-second timestamp of the last successfully finalized
/// sync. Absence means 0: the next sync ships everything.
#[derive(Clone)]
pub struct WatermarkStore {
    pool: SqlitePool,
}

impl WatermarkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The current watermark, or 0 when none was ever written.
    pub async fn last_sync_timestamp(&self) -> Result<i64> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM sync_state WHERE key = ?")
                .bind(WATERMARK_KEY)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row
            .and_then(|(value,)| value.parse::<i64>().ok())
            .unwrap_or(0))
    }

    /// Advance the watermark. Called only after a finalize exchange
    /// completes.
    pub async fn set_last_sync_timestamp(&self, timestamp: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(WATERMARK_KEY)
        .bind(timestamp.to_string())
        .execute(&self.pool)
        .await?;

        tracing::debug!("Watermark advanced to {}", timestamp);
        Ok(())
    }
}
