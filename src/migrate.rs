use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Local repository items
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id TEXT PRIMARY KEY,
            collection_id TEXT NOT NULL,
            handle TEXT UNIQUE,
            last_modified TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS metadata_values (
            item_id TEXT NOT NULL,
            field TEXT NOT NULL,
            value TEXT NOT NULL,
            place INTEGER NOT NULL,
            FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bitstreams (
            id TEXT PRIMARY KEY,
            item_id TEXT NOT NULL,
            bundle TEXT NOT NULL,
            name TEXT NOT NULL,
            content BLOB NOT NULL,
            checksum TEXT NOT NULL,
            UNIQUE(item_id, bundle, name),
            FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Harvest bindings
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS harvested_collections (
            collection_id TEXT PRIMARY KEY,
            oai_source TEXT NOT NULL,
            oai_set_id TEXT NOT NULL,
            metadata_format TEXT NOT NULL,
            harvest_type TEXT NOT NULL,
            status TEXT NOT NULL,
            last_harvested TEXT,
            harvest_start_time TEXT,
            message TEXT,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            claimed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS harvested_items (
            item_id TEXT PRIMARY KEY,
            collection_id TEXT NOT NULL,
            oai_id TEXT NOT NULL,
            harvest_date TEXT,
            UNIQUE(collection_id, oai_id),
            FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_metadata_item_field ON metadata_values(item_id, field)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_metadata_field_value ON metadata_values(field, value)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_last_modified ON items(last_modified)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_harvested_collections_schedule ON harvested_collections(status, last_harvested, collection_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
