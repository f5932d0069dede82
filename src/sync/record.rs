// sync/record.rs - Change records and dynamic row values
//
// Synced rows travel as self-contained maps of column name to JSON value.
// BLOB columns are base64 strings on the wire and byte arrays in SQLite.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};

use crate::sync::tables::SyncTable;
use crate::{Error, Result};

/// Logical operation carried by one change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordOperation {
    Insert,
    Update,
    Delete,
}

impl RecordOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordOperation::Insert => "insert",
            RecordOperation::Update => "update",
            RecordOperation::Delete => "delete",
        }
    }
}

/// One self-contained row change, as transmitted and as buffered.
///
/// `delete` records carry the full row with `deleted_at` set; rows are
/// never physically removed on either peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub table: String,
    pub operation: RecordOperation,
    pub record: Map<String, Value>,
}

impl ChangeRecord {
    /// The record's primary-key value under `table`'s key column.
    pub fn primary_key_value(&self, table: &SyncTable) -> Option<&Value> {
        self.record.get(table.primary_key).filter(|v| !v.is_null())
    }
}

/// Convert an ISO-8601 timestamp to unix seconds, floor(ms / 1000).
///
/// Accepts RFC 3339 (`2024-01-05T10:30:00Z`, with or without fractional
/// seconds or an offset) and SQLite's `CURRENT_TIMESTAMP` shape
/// (`2024-01-05 10:30:00`, interpreted as UTC).
pub fn to_unix_seconds(timestamp: &str) -> Result<i64> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp) {
        return Ok(parsed.timestamp_millis().div_euclid(1000));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(timestamp, format) {
            return Ok(naive.and_utc().timestamp_millis().div_euclid(1000));
        }
    }
    Err(Error::Apply(format!("unparseable timestamp: {timestamp}")))
}

/// Read a timestamp column out of a record map.
///
/// Returns `None` when the column is absent or null.
pub fn record_timestamp(record: &Map<String, Value>, column: &str) -> Result<Option<i64>> {
    match record.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => to_unix_seconds(text).map(Some),
        Some(other) => Err(Error::Apply(format!(
            "column {column} holds a non-text timestamp: {other}"
        ))),
    }
}

/// Decode a dynamically-typed SQLite row into a record map.
///
/// BLOB values are base64-encoded so the map can cross the JSON wire.
pub fn row_to_record(row: &SqliteRow) -> Result<Map<String, Value>> {
    let mut record = Map::new();
    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index)?;
        let is_null = raw.is_null();
        let type_name = raw.type_info().name().to_string();
        drop(raw);

        let value = if is_null {
            Value::Null
        } else {
            match type_name.as_str() {
                "INTEGER" => Value::from(row.try_get::<i64, _>(index)?),
                "REAL" => Value::from(row.try_get::<f64, _>(index)?),
                "BLOB" => Value::String(BASE64.encode(row.try_get::<Vec<u8>, _>(index)?)),
                _ => Value::String(row.try_get::<String, _>(index)?),
            }
        };
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

/// Bind one record value to the next statement placeholder.
///
/// `as_blob` marks registered BLOB columns: their string values are
/// base64-decoded back to bytes before binding.
pub(crate) fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
    as_blob: bool,
) -> Result<Query<'q, Sqlite, SqliteArguments<'q>>> {
    let bound = match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(flag) => query.bind(*flag),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                query.bind(int)
            } else if let Some(float) = number.as_f64() {
                query.bind(float)
            } else {
                return Err(Error::Apply(format!("unsupported numeric value: {number}")));
            }
        }
        Value::String(text) => {
            if as_blob {
                let bytes = BASE64
                    .decode(text)
                    .map_err(|e| Error::Apply(format!("invalid base64 blob value: {e}")))?;
                query.bind(bytes)
            } else {
                query.bind(text.as_str())
            }
        }
        other => {
            return Err(Error::Apply(format!(
                "unsupported value type in record: {other}"
            )))
        }
    };
    Ok(bound)
}
