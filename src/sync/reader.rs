// sync/reader.rs - Local change enumeration
//
// Returns every row changed since a watermark, classified into the
// operation the peer should apply. BLOB-bearing tables use a two-phase
// read: metadata rows first, then each BLOB column fetched directly or in
// fixed windows so a large payload never has to fit one cursor row.

use std::collections::VecDeque;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};

use crate::sync::record::{bind_value, record_timestamp, row_to_record, ChangeRecord, RecordOperation};
use crate::sync::tables::{SyncTable, SYNC_TABLES};
use crate::{Error, Result};

/// Reads local changes for transmission.
#[derive(Clone)]
pub struct ChangeReader {
    pool: SqlitePool,
    blob_inline_limit: i64,
    blob_chunk_size: i64,
}

impl ChangeReader {
    pub fn new(pool: SqlitePool, blob_inline_limit: i64, blob_chunk_size: i64) -> Self {
        Self {
            pool,
            blob_inline_limit,
            blob_chunk_size,
        }
    }

    /// All rows of `table` changed since the `since` watermark, in the
    /// order the store returns them.
    ///
    /// `since = 0` is the first-sync seed: every row ships regardless of
    /// historical timestamps.
    pub async fn read_changes(
        &self,
        table: &'static SyncTable,
        since: i64,
    ) -> Result<Vec<ChangeRecord>> {
        let select_list = self.non_blob_columns(table).await?.join(", ");

        let sql = if since == 0 {
            format!(
                "SELECT {select_list} FROM {} WHERE deleted_at IS NULL OR deleted_at > 0",
                table.name
            )
        } else {
            format!(
                "SELECT {select_list} FROM {} \
                 WHERE CAST(strftime('%s', created_at) AS INTEGER) > ? \
                 OR CAST(strftime('%s', updated_at) AS INTEGER) > ? \
                 OR (deleted_at IS NOT NULL AND CAST(strftime('%s', deleted_at) AS INTEGER) > ?)",
                table.name
            )
        };

        let query = if since == 0 {
            sqlx::query(&sql)
        } else {
            sqlx::query(&sql).bind(since).bind(since).bind(since)
        };

        let rows = query.fetch_all(&self.pool).await?;
        let mut changes = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = row_to_record(row)?;
            if !table.blob_columns.is_empty() {
                self.attach_blob_columns(table, &mut record).await?;
            }
            let operation = classify_operation(&record, since)?;
            changes.push(ChangeRecord {
                table: table.name.to_string(),
                operation,
                record,
            });
        }
        Ok(changes)
    }

    /// Phase 1 column set: everything except registered BLOB columns.
    async fn non_blob_columns(&self, table: &SyncTable) -> Result<Vec<String>> {
        let sql = format!("SELECT name FROM pragma_table_info('{}')", table.name);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get(0)?;
            if !table.is_blob_column(&name) {
                columns.push(name);
            }
        }
        if columns.is_empty() {
            return Err(Error::Database(format!(
                "table {} has no readable columns",
                table.name
            )));
        }
        Ok(columns)
    }

    /// Phase 2: fetch each BLOB column for one matched row.
    ///
    /// A failed column read logs, ships null for that column and keeps
    /// going; one unreadable payload must not sink the whole table.
    async fn attach_blob_columns(
        &self,
        table: &SyncTable,
        record: &mut Map<String, Value>,
    ) -> Result<()> {
        let pk = record
            .get(table.primary_key)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| {
                Error::Database(format!(
                    "row in {} lacks primary key {}",
                    table.name, table.primary_key
                ))
            })?;

        for &column in table.blob_columns {
            match self.read_blob(table, column, &pk).await {
                Ok(value) => {
                    record.insert(column.to_string(), value);
                }
                Err(err) => {
                    tracing::warn!("Failed to read {}.{}: {}", table.name, column, err);
                    record.insert(column.to_string(), Value::Null);
                }
            }
        }
        Ok(())
    }

    async fn read_blob(&self, table: &SyncTable, column: &str, pk: &Value) -> Result<Value> {
        let sql = format!(
            "SELECT length({column}) FROM {} WHERE {} = ?",
            table.name, table.primary_key
        );
        let row = bind_value(sqlx::query(&sql), pk, false)?
            .fetch_optional(&self.pool)
            .await?;
        let length: Option<i64> = match row {
            Some(row) => row.try_get(0)?,
            None => return Ok(Value::Null),
        };
        let Some(length) = length else {
            return Ok(Value::Null);
        };

        let bytes = if length <= self.blob_inline_limit {
            let sql = format!(
                "SELECT {column} FROM {} WHERE {} = ?",
                table.name, table.primary_key
            );
            let row = bind_value(sqlx::query(&sql), pk, false)?
                .fetch_one(&self.pool)
                .await?;
            row.try_get::<Vec<u8>, _>(0)?
        } else {
            // substr on a BLOB is byte-addressed and 1-indexed
            let mut bytes: Vec<u8> = Vec::with_capacity(length as usize);
            let mut offset: i64 = 1;
            while offset <= length {
                let sql = format!(
                    "SELECT substr({column}, ?, ?) FROM {} WHERE {} = ?",
                    table.name, table.primary_key
                );
                let query = sqlx::query(&sql).bind(offset).bind(self.blob_chunk_size);
                let row = bind_value(query, pk, false)?.fetch_one(&self.pool).await?;
                let chunk: Vec<u8> = row.try_get(0)?;
                if chunk.is_empty() {
                    break;
                }
                offset += chunk.len() as i64;
                bytes.extend_from_slice(&chunk);
            }
            bytes
        };

        Ok(Value::String(BASE64.encode(bytes)))
    }
}

/// Decide which operation to transmit for a locally changed row.
///
/// Deleted rows always travel as `delete`; otherwise rows created after
/// the watermark are `insert` and everything else is `update`.
pub fn classify_operation(record: &Map<String, Value>, since: i64) -> Result<RecordOperation> {
    if record_timestamp(record, "deleted_at")?.is_some() {
        return Ok(RecordOperation::Delete);
    }
    match record_timestamp(record, "created_at")? {
        Some(created_at) if created_at > since => Ok(RecordOperation::Insert),
        _ => Ok(RecordOperation::Update),
    }
}

/// Snapshot of all local changes pending transmission, tables in
/// dependency order.
///
/// Taken before the incoming buffer is applied so a session never echoes
/// rows it just received back to the peer.
pub struct OutgoingQueue {
    records: VecDeque<ChangeRecord>,
}

impl OutgoingQueue {
    /// Read every table's changes since the watermark.
    pub async fn snapshot(reader: &ChangeReader, since: i64) -> Result<Self> {
        let mut records = VecDeque::new();
        for table in SYNC_TABLES {
            let changes = reader.read_changes(table, since).await?;
            if !changes.is_empty() {
                tracing::debug!("{} changed rows in {}", changes.len(), table.name);
            }
            records.extend(changes);
        }
        Ok(Self { records })
    }

    /// The next record to transmit; `None` once every table is drained.
    pub fn next(&mut self) -> Option<ChangeRecord> {
        self.records.pop_front()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
