// db/migrations.rs - Database schema migrations

use crate::Result;
use sqlx::SqlitePool;

/// Run all database migrations
///
/// Migrations are idempotent and safe to run multiple times. Every synced
/// table carries the uniform soft-delete columns (`created_at`,
/// `updated_at`, `deleted_at`) as ISO-8601 text.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    // Create migrations table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Run migrations in order
    run_if_needed(pool, 1, "create_character_profiles_table").await?;
    run_if_needed(pool, 2, "create_character_profile_images_table").await?;
    run_if_needed(pool, 3, "create_provider_configurations_table").await?;
    run_if_needed(pool, 4, "create_module_configurations_table").await?;
    run_if_needed(pool, 5, "create_entities_table").await?;
    run_if_needed(pool, 6, "create_entity_module_mappings_table").await?;
    run_if_needed(pool, 7, "create_conversation_tables").await?;
    run_if_needed(pool, 8, "create_sync_state_table").await?;
    run_if_needed(pool, 9, "create_sync_indices").await?;

    Ok(())
}

/// Check if migration is needed and run the appropriate SQL
async fn run_if_needed(pool: &SqlitePool, id: i32, name: &str) -> Result<()> {
    let exists: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _migrations WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;

    if exists.0 == 0 {
        tracing::info!("Running migration {}: {}", id, name);

        match id {
            1 => create_character_profiles_table(pool).await?,
            2 => create_character_profile_images_table(pool).await?,
            3 => create_provider_configurations_table(pool).await?,
            4 => create_module_configurations_table(pool).await?,
            5 => create_entities_table(pool).await?,
            6 => create_entity_module_mappings_table(pool).await?,
            7 => create_conversation_tables(pool).await?,
            8 => create_sync_state_table(pool).await?,
            9 => create_sync_indices(pool).await?,
            _ => return Err(crate::Error::Config(format!("Unknown migration id: {}", id))),
        }

        sqlx::query("INSERT INTO _migrations (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(pool)
            .await?;

        tracing::info!("Migration {} completed", id);
    }

    Ok(())
}

/// Migration 1: Create character profiles table
async fn create_character_profiles_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE character_profiles (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            persona TEXT,
            first_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 2: Create character profile images table
async fn create_character_profile_images_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE character_profile_images (
            id TEXT PRIMARY KEY,
            profile_id TEXT NOT NULL REFERENCES character_profiles(id),
            mime_type TEXT,
            image_data BLOB,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 3: Create provider configurations table
async fn create_provider_configurations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE provider_configurations (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            provider_kind TEXT NOT NULL,
            endpoint TEXT,
            settings TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 4: Create module configurations table
async fn create_module_configurations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE module_configurations (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            module_kind TEXT NOT NULL,
            settings TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 5: Create entities table
async fn create_entities_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE entities (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            profile_id TEXT REFERENCES character_profiles(id),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 6: Create entity module mappings table
///
/// Keyed by `entity_id` rather than a surrogate id; one mapping row per
/// entity.
async fn create_entity_module_mappings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE entity_module_mappings (
            entity_id TEXT PRIMARY KEY REFERENCES entities(id),
            module_id TEXT NOT NULL,
            settings TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 7: Create conversations and messages tables
async fn create_conversation_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE conversations (
            id TEXT PRIMARY KEY,
            entity_id TEXT REFERENCES entities(id),
            title TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            role TEXT NOT NULL,
            content TEXT,
            audio_data BLOB,
            embedding BLOB,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 8: Create sync state table (watermark storage)
async fn create_sync_state_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE sync_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration 9: Create indices used by the change predicate
async fn create_sync_indices(pool: &SqlitePool) -> Result<()> {
    for table in [
        "character_profiles",
        "character_profile_images",
        "provider_configurations",
        "module_configurations",
        "entities",
        "entity_module_mappings",
        "conversations",
        "messages",
    ] {
        sqlx::query(&format!(
            "CREATE INDEX idx_{table}_updated_at ON {table}(updated_at)"
        ))
        .execute(pool)
        .await?;
    }

    Ok(())
}
