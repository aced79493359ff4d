//! SQLite persistence for items and harvest bookkeeping.
//!
//! Status changes are compare-and-swap updates: each statement names the
//! statuses the row may currently be in (taken from
//! [`Transition::sources`]) and reports whether it won. A `false` return
//! means another worker or an administrator got there first.
//!
//! Item writes take a `&mut SqliteConnection` so the harvester can group
//! one record's changes in a transaction.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::filter::StoragePredicate;
use crate::models::{
    format_ts, parse_ts, Bitstream, HarvestType, HarvestedCollection, HarvestedItem, Item,
    MetadataValue,
};
use crate::status::{HarvestStatus, Transition};

type Result<T> = std::result::Result<T, sqlx::Error>;

/// Outcome of trying to take exclusive ownership of a queued collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Someone else moved the row out of QUEUED first.
    Conflict,
}

fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

fn opt_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value.as_deref().and_then(parse_ts)
}

/// `'READY', 'OAI_ERROR'` for use in `status IN (...)`.
fn source_list(transition: Transition) -> String {
    transition
        .sources()
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ═══════════════════════════════════════════════════════════════════════
// Harvested collections
// ═══════════════════════════════════════════════════════════════════════

const COLLECTION_COLUMNS: &str = "collection_id, oai_source, oai_set_id, metadata_format, harvest_type, status, last_harvested, harvest_start_time, message, consecutive_failures";

fn row_to_collection(row: &SqliteRow) -> Result<HarvestedCollection> {
    let status: String = row.try_get("status")?;
    let harvest_type: String = row.try_get("harvest_type")?;
    let failures: i64 = row.try_get("consecutive_failures")?;
    Ok(HarvestedCollection {
        collection_id: row.try_get("collection_id")?,
        oai_source: row.try_get("oai_source")?,
        oai_set_id: row.try_get("oai_set_id")?,
        metadata_format: row.try_get("metadata_format")?,
        harvest_type: harvest_type.parse::<HarvestType>().map_err(decode_error)?,
        status: status.parse::<HarvestStatus>().map_err(decode_error)?,
        last_harvested: opt_ts(row.try_get("last_harvested")?),
        harvest_start_time: opt_ts(row.try_get("harvest_start_time")?),
        message: row.try_get("message")?,
        consecutive_failures: u32::try_from(failures).unwrap_or(u32::MAX),
    })
}

pub async fn insert_collection(pool: &SqlitePool, hc: &HarvestedCollection) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO harvested_collections
            (collection_id, oai_source, oai_set_id, metadata_format, harvest_type, status,
             last_harvested, harvest_start_time, message, consecutive_failures)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&hc.collection_id)
    .bind(&hc.oai_source)
    .bind(&hc.oai_set_id)
    .bind(&hc.metadata_format)
    .bind(hc.harvest_type.as_str())
    .bind(hc.status.as_str())
    .bind(hc.last_harvested.as_ref().map(format_ts))
    .bind(hc.harvest_start_time.as_ref().map(format_ts))
    .bind(&hc.message)
    .bind(hc.consecutive_failures as i64)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_collection(pool: &SqlitePool, id: &str) -> Result<Option<HarvestedCollection>> {
    let sql = format!(
        "SELECT {} FROM harvested_collections WHERE collection_id = ?",
        COLLECTION_COLUMNS
    );
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(row_to_collection).transpose()
}

pub async fn list_collections(pool: &SqlitePool) -> Result<Vec<HarvestedCollection>> {
    let sql = format!(
        "SELECT {} FROM harvested_collections ORDER BY collection_id",
        COLLECTION_COLUMNS
    );
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(row_to_collection).collect()
}

/// Collections the scheduler may queue, oldest harvest first. Rows never
/// harvested come before everything else; ties go to the lower id.
pub async fn select_schedulable(
    pool: &SqlitePool,
    failure_threshold: u32,
    limit: usize,
) -> Result<Vec<HarvestedCollection>> {
    let sql = format!(
        r#"
        SELECT {} FROM harvested_collections
        WHERE status = 'READY'
           OR (status = 'OAI_ERROR' AND consecutive_failures < ?)
        ORDER BY last_harvested IS NOT NULL, last_harvested ASC, collection_id ASC
        LIMIT ?
        "#,
        COLLECTION_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(failure_threshold as i64)
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_collection).collect()
}

/// READY or OAI_ERROR (below the threshold) → QUEUED.
pub async fn queue(pool: &SqlitePool, id: &str, failure_threshold: u32) -> Result<bool> {
    let sql = format!(
        r#"
        UPDATE harvested_collections SET status = ?
        WHERE collection_id = ? AND status IN ({})
          AND (status = 'READY' OR consecutive_failures < ?)
        "#,
        source_list(Transition::Queue)
    );
    let result = sqlx::query(&sql)
        .bind(Transition::Queue.target().as_str())
        .bind(id)
        .bind(failure_threshold as i64)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// QUEUED → BUSY, recording the cycle start.
pub async fn claim(pool: &SqlitePool, id: &str, started: &DateTime<Utc>) -> Result<ClaimOutcome> {
    let sql = format!(
        r#"
        UPDATE harvested_collections
        SET status = ?, harvest_start_time = ?, claimed_at = ?,
            message = 'Collection is currently being harvested'
        WHERE collection_id = ? AND status IN ({})
        "#,
        source_list(Transition::Claim)
    );
    let started = format_ts(started);
    let result = sqlx::query(&sql)
        .bind(Transition::Claim.target().as_str())
        .bind(&started)
        .bind(&started)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(if result.rows_affected() == 1 {
        ClaimOutcome::Claimed
    } else {
        ClaimOutcome::Conflict
    })
}

/// QUEUED → READY after a claim attempt failed.
pub async fn release_claim(pool: &SqlitePool, id: &str) -> Result<bool> {
    simple_transition(pool, id, Transition::ClaimFailed).await
}

/// BUSY → READY. `last_harvested` becomes the cycle start, not the finish.
pub async fn complete(
    pool: &SqlitePool,
    id: &str,
    started: &DateTime<Utc>,
    message: &str,
) -> Result<bool> {
    let sql = format!(
        r#"
        UPDATE harvested_collections
        SET status = ?, last_harvested = ?, message = ?, consecutive_failures = 0,
            harvest_start_time = NULL, claimed_at = NULL
        WHERE collection_id = ? AND status IN ({})
        "#,
        source_list(Transition::Complete)
    );
    let result = sqlx::query(&sql)
        .bind(Transition::Complete.target().as_str())
        .bind(format_ts(started))
        .bind(message)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// BUSY → OAI_ERROR. Only permanent failures count toward the hold.
pub async fn fail(pool: &SqlitePool, id: &str, message: &str, counts: bool) -> Result<bool> {
    let sql = format!(
        r#"
        UPDATE harvested_collections
        SET status = ?, message = ?, consecutive_failures = consecutive_failures + ?,
            harvest_start_time = NULL, claimed_at = NULL
        WHERE collection_id = ? AND status IN ({})
        "#,
        source_list(Transition::Fail)
    );
    let result = sqlx::query(&sql)
        .bind(Transition::Fail.target().as_str())
        .bind(message)
        .bind(if counts { 1_i64 } else { 0 })
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// QUEUED or BUSY → READY without touching `last_harvested`.
pub async fn interrupt(pool: &SqlitePool, id: &str, message: &str) -> Result<bool> {
    let sql = format!(
        r#"
        UPDATE harvested_collections
        SET status = ?, message = ?, harvest_start_time = NULL, claimed_at = NULL
        WHERE collection_id = ? AND status IN ({})
        "#,
        source_list(Transition::Interrupt)
    );
    let result = sqlx::query(&sql)
        .bind(Transition::Interrupt.target().as_str())
        .bind(message)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Release every QUEUED or BUSY row left behind by a previous process.
pub async fn recover_stale_claims(pool: &SqlitePool) -> Result<u64> {
    let sql = format!(
        r#"
        UPDATE harvested_collections
        SET status = ?, message = 'Harvest was interrupted and has been released',
            harvest_start_time = NULL, claimed_at = NULL
        WHERE status IN ({})
        "#,
        source_list(Transition::Interrupt)
    );
    let result = sqlx::query(&sql)
        .bind(Transition::Interrupt.target().as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn disable(pool: &SqlitePool, id: &str) -> Result<bool> {
    simple_transition(pool, id, Transition::Disable).await
}

pub async fn enable(pool: &SqlitePool, id: &str) -> Result<bool> {
    simple_transition(pool, id, Transition::Enable).await
}

/// OAI_ERROR → READY, clearing the failure count.
pub async fn reset(pool: &SqlitePool, id: &str) -> Result<bool> {
    let sql = format!(
        r#"
        UPDATE harvested_collections
        SET status = ?, consecutive_failures = 0, message = NULL
        WHERE collection_id = ? AND status IN ({})
        "#,
        source_list(Transition::Reset)
    );
    let result = sqlx::query(&sql)
        .bind(Transition::Reset.target().as_str())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

async fn simple_transition(pool: &SqlitePool, id: &str, transition: Transition) -> Result<bool> {
    let sql = format!(
        "UPDATE harvested_collections SET status = ? WHERE collection_id = ? AND status IN ({})",
        source_list(transition)
    );
    let result = sqlx::query(&sql)
        .bind(transition.target().as_str())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Progress message for a running cycle.
pub async fn set_message(pool: &SqlitePool, id: &str, message: &str) -> Result<()> {
    sqlx::query("UPDATE harvested_collections SET message = ? WHERE collection_id = ?")
        .bind(message)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Items
// ═══════════════════════════════════════════════════════════════════════

pub async fn insert_item(conn: &mut SqliteConnection, item: &Item) -> Result<()> {
    sqlx::query("INSERT INTO items (id, collection_id, handle, last_modified) VALUES (?, ?, ?, ?)")
        .bind(&item.id)
        .bind(&item.collection_id)
        .bind(&item.handle)
        .bind(format_ts(&item.last_modified))
        .execute(&mut *conn)
        .await?;
    write_metadata(conn, &item.id, &item.metadata).await
}

/// Overwrite handle, timestamp and every metadata value.
pub async fn update_item(conn: &mut SqliteConnection, item: &Item) -> Result<()> {
    sqlx::query("UPDATE items SET handle = ?, last_modified = ? WHERE id = ?")
        .bind(&item.handle)
        .bind(format_ts(&item.last_modified))
        .bind(&item.id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM metadata_values WHERE item_id = ?")
        .bind(&item.id)
        .execute(&mut *conn)
        .await?;
    write_metadata(conn, &item.id, &item.metadata).await
}

async fn write_metadata(
    conn: &mut SqliteConnection,
    item_id: &str,
    metadata: &[MetadataValue],
) -> Result<()> {
    for (place, mv) in metadata.iter().enumerate() {
        sqlx::query("INSERT INTO metadata_values (item_id, field, value, place) VALUES (?, ?, ?, ?)")
            .bind(item_id)
            .bind(&mv.field)
            .bind(&mv.value)
            .bind(place as i64)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Remove an item. Metadata, bitstreams and the harvest mapping cascade.
pub async fn delete_item(conn: &mut SqliteConnection, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM items WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn find_item_by_handle(
    conn: &mut SqliteConnection,
    handle: &str,
) -> Result<Option<String>> {
    sqlx::query_scalar("SELECT id FROM items WHERE handle = ?")
        .bind(handle)
        .fetch_optional(&mut *conn)
        .await
}

pub async fn load_item(pool: &SqlitePool, id: &str) -> Result<Option<Item>> {
    let row = sqlx::query("SELECT id, collection_id, handle, last_modified FROM items WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let last_modified: String = row.try_get("last_modified")?;
    let last_modified = parse_ts(&last_modified)
        .ok_or_else(|| decode_error(format!("bad last_modified '{}'", last_modified)))?;

    let metadata = sqlx::query(
        "SELECT field, value FROM metadata_values WHERE item_id = ? ORDER BY place ASC",
    )
    .bind(id)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|r| -> Result<MetadataValue> {
        Ok(MetadataValue::new(
            r.try_get::<String, _>("field")?,
            r.try_get::<String, _>("value")?,
        ))
    })
    .collect::<Result<Vec<_>>>()?;

    Ok(Some(Item {
        id: row.try_get("id")?,
        collection_id: row.try_get("collection_id")?,
        handle: row.try_get("handle")?,
        last_modified,
        metadata,
    }))
}

pub async fn list_item_ids(pool: &SqlitePool) -> Result<Vec<String>> {
    sqlx::query_scalar("SELECT id FROM items ORDER BY id")
        .fetch_all(pool)
        .await
}

/// Ids of items matching a translated filter, sorted ascending.
pub async fn query_items(pool: &SqlitePool, predicate: &StoragePredicate) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT items.id FROM items WHERE {} ORDER BY items.id",
        predicate.template
    );
    let mut query = sqlx::query_scalar::<_, String>(&sql);
    for param in &predicate.params {
        query = query.bind(param);
    }
    query.fetch_all(pool).await
}

pub async fn put_bitstream(
    conn: &mut SqliteConnection,
    item_id: &str,
    bitstream: &Bitstream,
) -> Result<()> {
    let checksum = format!("{:x}", Sha256::digest(&bitstream.content));
    sqlx::query(
        r#"
        INSERT INTO bitstreams (id, item_id, bundle, name, content, checksum)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(item_id, bundle, name) DO UPDATE SET
            content = excluded.content,
            checksum = excluded.checksum
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(item_id)
    .bind(&bitstream.bundle)
    .bind(&bitstream.name)
    .bind(&bitstream.content)
    .bind(checksum)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn delete_bitstreams(
    conn: &mut SqliteConnection,
    item_id: &str,
    bundle: &str,
) -> Result<u64> {
    let result = sqlx::query("DELETE FROM bitstreams WHERE item_id = ? AND bundle = ?")
        .bind(item_id)
        .bind(bundle)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn list_bitstreams(pool: &SqlitePool, item_id: &str) -> Result<Vec<Bitstream>> {
    let rows = sqlx::query(
        "SELECT bundle, name, content FROM bitstreams WHERE item_id = ? ORDER BY bundle, name",
    )
    .bind(item_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|r| -> Result<Bitstream> {
            Ok(Bitstream {
                bundle: r.try_get("bundle")?,
                name: r.try_get("name")?,
                content: r.try_get("content")?,
            })
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Harvested items
// ═══════════════════════════════════════════════════════════════════════

fn row_to_harvested_item(row: &SqliteRow) -> Result<HarvestedItem> {
    Ok(HarvestedItem {
        item_id: row.try_get("item_id")?,
        collection_id: row.try_get("collection_id")?,
        oai_id: row.try_get("oai_id")?,
        harvest_date: opt_ts(row.try_get("harvest_date")?),
    })
}

pub async fn find_harvested_item(
    conn: &mut SqliteConnection,
    collection_id: &str,
    oai_id: &str,
) -> Result<Option<HarvestedItem>> {
    let row = sqlx::query(
        "SELECT item_id, collection_id, oai_id, harvest_date FROM harvested_items WHERE collection_id = ? AND oai_id = ?",
    )
    .bind(collection_id)
    .bind(oai_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(row_to_harvested_item).transpose()
}

pub async fn list_harvested_items(
    pool: &SqlitePool,
    collection_id: &str,
) -> Result<Vec<HarvestedItem>> {
    let rows = sqlx::query(
        "SELECT item_id, collection_id, oai_id, harvest_date FROM harvested_items WHERE collection_id = ? ORDER BY oai_id",
    )
    .bind(collection_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_harvested_item).collect()
}

/// Insert or refresh the mapping for an item.
pub async fn upsert_harvested_item(conn: &mut SqliteConnection, hi: &HarvestedItem) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO harvested_items (item_id, collection_id, oai_id, harvest_date)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(item_id) DO UPDATE SET harvest_date = excluded.harvest_date
        "#,
    )
    .bind(&hi.item_id)
    .bind(&hi.collection_id)
    .bind(&hi.oai_id)
    .bind(hi.harvest_date.as_ref().map(format_ts))
    .execute(&mut *conn)
    .await?;
    Ok(())
}
