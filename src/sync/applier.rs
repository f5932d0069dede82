// sync/applier.rs - Atomic apply of buffered incoming records
//
// The whole incoming buffer is applied inside one transaction: the local
// store observes either the old world or the new one, never a prefix that
// could violate foreign-key dependencies.

use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::sync::record::{bind_value, record_timestamp, to_unix_seconds, ChangeRecord, RecordOperation};
use crate::sync::tables::{is_safe_identifier, table_by_name, SyncTable};
use crate::{Error, Result};

/// Applies buffered change records with last-write-wins resolution.
#[derive(Clone)]
pub struct RecordApplier {
    pool: SqlitePool,
}

impl RecordApplier {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Validate one inbound record before it enters the buffer.
    ///
    /// Runs at receipt time so a malformed record can be confirmed with an
    /// error while nothing has been persisted yet.
    pub fn validate(change: &ChangeRecord) -> Result<()> {
        let table = table_by_name(&change.table)
            .ok_or_else(|| Error::Apply(format!("unknown table: {}", change.table)))?;

        change.primary_key_value(table).ok_or_else(|| {
            Error::Apply(format!(
                "record for {} lacks primary key {}",
                table.name, table.primary_key
            ))
        })?;

        for column in change.record.keys() {
            if !is_safe_identifier(column) {
                return Err(Error::Apply(format!("invalid column name: {column}")));
            }
        }

        // Timestamps must convert; LWW and soft delete depend on them
        record_timestamp(&change.record, "created_at")?;
        record_timestamp(&change.record, "updated_at")?;
        let deleted_at = record_timestamp(&change.record, "deleted_at")?;
        if change.operation == RecordOperation::Delete && deleted_at.is_none() {
            return Err(Error::Apply(format!(
                "delete record for {} carries no deleted_at",
                table.name
            )));
        }

        Ok(())
    }

    /// Apply every buffered record in one transaction, all or none.
    pub async fn apply_all(&self, records: &[ChangeRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            // Any failure drops the transaction and rolls everything back
            apply_one(&mut tx, record).await?;
        }
        tx.commit().await?;

        tracing::info!("Applied {} incoming records", records.len());
        Ok(())
    }
}

async fn apply_one(tx: &mut Transaction<'_, Sqlite>, change: &ChangeRecord) -> Result<()> {
    let table = table_by_name(&change.table)
        .ok_or_else(|| Error::Apply(format!("unknown table: {}", change.table)))?;
    let pk_value = change.primary_key_value(table).ok_or_else(|| {
        Error::Apply(format!(
            "record for {} lacks primary key {}",
            table.name, table.primary_key
        ))
    })?;

    match change.operation {
        RecordOperation::Delete => {
            // Soft delete: touch the tombstone columns, never remove the
            // row. A missing row is fine (idempotent delete).
            let deleted_at = change.record.get("deleted_at").cloned().unwrap_or_default();
            let updated_at = change.record.get("updated_at").cloned().unwrap_or_default();

            let sql = format!(
                "UPDATE {} SET deleted_at = ?, updated_at = ? WHERE {} = ?",
                table.name, table.primary_key
            );
            let query = sqlx::query(&sql);
            let query = bind_value(query, &deleted_at, false)?;
            let query = bind_value(query, &updated_at, false)?;
            let query = bind_value(query, pk_value, false)?;
            query.execute(&mut **tx).await?;
        }
        RecordOperation::Insert | RecordOperation::Update => {
            let sql = format!(
                "SELECT updated_at FROM {} WHERE {} = ?",
                table.name, table.primary_key
            );
            let existing = bind_value(sqlx::query(&sql), pk_value, false)?
                .fetch_optional(&mut **tx)
                .await?;

            match existing {
                None => insert_row(tx, table, change).await?,
                Some(row) => {
                    let stored: Option<String> = row.try_get(0)?;
                    let stored_ts = match stored {
                        Some(text) => to_unix_seconds(&text)?,
                        None => 0,
                    };
                    let incoming_ts =
                        record_timestamp(&change.record, "updated_at")?.unwrap_or(0);

                    // Incoming wins ties
                    if incoming_ts >= stored_ts {
                        update_row(tx, table, change, pk_value).await?;
                    } else {
                        tracing::debug!(
                            "Keeping newer local row {}.{:?}",
                            table.name,
                            pk_value
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

async fn insert_row(
    tx: &mut Transaction<'_, Sqlite>,
    table: &SyncTable,
    change: &ChangeRecord,
) -> Result<()> {
    let mut columns = Vec::with_capacity(change.record.len());
    for column in change.record.keys() {
        if !is_safe_identifier(column) {
            return Err(Error::Apply(format!("invalid column name: {column}")));
        }
        columns.push(column.as_str());
    }

    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.name,
        columns.join(", "),
        placeholders
    );

    let mut query = sqlx::query(&sql);
    for (column, value) in &change.record {
        query = bind_value(query, value, table.is_blob_column(column))?;
    }
    query.execute(&mut **tx).await?;
    Ok(())
}

async fn update_row(
    tx: &mut Transaction<'_, Sqlite>,
    table: &SyncTable,
    change: &ChangeRecord,
    pk_value: &serde_json::Value,
) -> Result<()> {
    let mut assignments = Vec::with_capacity(change.record.len());
    for column in change.record.keys() {
        if column == table.primary_key {
            continue;
        }
        if !is_safe_identifier(column) {
            return Err(Error::Apply(format!("invalid column name: {column}")));
        }
        assignments.push(format!("{column} = ?"));
    }
    if assignments.is_empty() {
        return Ok(());
    }

    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?",
        table.name,
        assignments.join(", "),
        table.primary_key
    );

    let mut query = sqlx::query(&sql);
    for (column, value) in &change.record {
        if column == table.primary_key {
            continue;
        }
        query = bind_value(query, value, table.is_blob_column(column))?;
    }
    query = bind_value(query, pk_value, false)?;
    query.execute(&mut **tx).await?;
    Ok(())
}
