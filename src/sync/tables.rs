// sync/tables.rs - Registry of synchronized tables

/// Static description of one synchronized table.
///
/// Every synced table carries `created_at`, `updated_at` and `deleted_at`
/// ISO-8601 text columns and a single primary-key column. BLOB columns are
/// listed explicitly so the change reader can run its two-phase read and
/// the applier knows which incoming values to base64-decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTable {
    pub name: &'static str,
    pub primary_key: &'static str,
    pub blob_columns: &'static [&'static str],
}

impl SyncTable {
    pub fn is_blob_column(&self, column: &str) -> bool {
        self.blob_columns.contains(&column)
    }
}

/// All synchronized tables in foreign-key dependency order.
///
/// Client sends drain tables in exactly this order so the host can apply
/// parents before children.
pub const SYNC_TABLES: &[SyncTable] = &[
    SyncTable {
        name: "character_profiles",
        primary_key: "id",
        blob_columns: &[],
    },
    SyncTable {
        name: "character_profile_images",
        primary_key: "id",
        blob_columns: &["image_data"],
    },
    SyncTable {
        name: "provider_configurations",
        primary_key: "id",
        blob_columns: &[],
    },
    SyncTable {
        name: "module_configurations",
        primary_key: "id",
        blob_columns: &[],
    },
    SyncTable {
        name: "entities",
        primary_key: "id",
        blob_columns: &[],
    },
    SyncTable {
        name: "entity_module_mappings",
        primary_key: "entity_id",
        blob_columns: &[],
    },
    SyncTable {
        name: "conversations",
        primary_key: "id",
        blob_columns: &[],
    },
    SyncTable {
        name: "messages",
        primary_key: "id",
        blob_columns: &["audio_data", "embedding"],
    },
];

/// Look up a synced table by its SQL name.
pub fn table_by_name(name: &str) -> Option<&'static SyncTable> {
    SYNC_TABLES.iter().find(|table| table.name == name)
}

/// True when `name` is safe to interpolate into a SQL statement.
///
/// Table names come from the registry, but column names arrive inside
/// peer-supplied records and must never smuggle SQL.
pub fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}
