//! One harvest cycle for one collection.
//!
//! # Cycle
//!
//! ```text
//! Identify ──▶ ListMetadataFormats ──▶ ListRecords(from, until, set)
//!                                          │
//!                      ┌───────────────────┤ per record
//!                      ▼                   │
//!            deleted? remove local item    │
//!            newer locally? skip           │
//!            else crosswalk + ORE + store  │
//!                      │                   │
//!                      └──▶ index submit ──┘
//!                                          │ per page
//!                                   index commit, follow resumptionToken
//! ```
//!
//! `from` is the previous cycle's start minus `time_padding_secs`, and
//! `until` is this cycle's start, both truncated to the remote
//! granularity. A cycle that has nothing new (`noRecordsMatch`) is a
//! success.
//!
//! [`run_cycle`] does not touch the collection's status; the caller has
//! already claimed it and records the outcome with [`record_outcome`].

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, MetadataFormatConfig};
use crate::crosswalk;
use crate::error::{ConfigError, HarvestError};
use crate::exposure;
use crate::filter::{Filter, FilterRegistry, FilterSet, Schema};
use crate::index::{IndexDocument, SearchIndex};
use crate::models::{Bitstream, HarvestType, HarvestedCollection, HarvestedItem, Item};
use crate::oai::{Granularity, ListRecordsRequest, OaiClient, Record};
use crate::store;

pub const NO_UPDATES_MESSAGE: &str = "OAI server did not contain any updates";
const ORE_BUNDLE: &str = "ORE";
const ORE_BITSTREAM: &str = "ORE.xml";
const CONTENT_BUNDLE: &str = "ORIGINAL";

/// Everything a harvest cycle needs, passed in explicitly.
pub struct HarvestContext {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub client: Arc<dyn OaiClient>,
    pub index: Arc<dyn SearchIndex>,
    pub schema: Schema,
    pub filters: FilterSet,
    /// Items it rejects are kept out of the search index.
    pub exposure: Option<Arc<Filter>>,
}

impl HarvestContext {
    /// Fails on any filter configuration problem, before a cycle can run.
    pub fn new(
        config: Arc<Config>,
        pool: SqlitePool,
        client: Arc<dyn OaiClient>,
        index: Arc<dyn SearchIndex>,
    ) -> Result<Self, ConfigError> {
        let schema = config.filter_schema();
        let filters = FilterRegistry::builtin().build(&config.filters, &schema)?;
        let exposure = match config.oai.exposure_filter.as_deref() {
            Some(name) => Some(filters.get(name).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "oai.exposure_filter '{}' is not a configured filter",
                    name
                ))
            })?),
            None => None,
        };
        Ok(Self {
            config,
            pool,
            client,
            index,
            schema,
            filters,
            exposure,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestSummary {
    pub imported: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub message: String,
}

enum RecordOutcome {
    Imported,
    Deleted,
    Skipped,
}

/// Remote prefixes resolved for this cycle.
struct Prefixes {
    metadata: String,
    ore: Option<String>,
}

fn index_error(e: anyhow::Error) -> HarvestError {
    HarvestError::Transient(format!("search index: {:#}", e))
}

/// Harvest everything new for a BUSY collection.
#[instrument(skip_all, fields(collection = %hc.collection_id))]
pub async fn run_cycle(
    ctx: &HarvestContext,
    hc: &HarvestedCollection,
    started: DateTime<Utc>,
) -> Result<HarvestSummary, HarvestError> {
    let harvester = &ctx.config.harvester;
    let format = ctx
        .config
        .metadata_formats
        .get(&hc.metadata_format)
        .ok_or_else(|| {
            HarvestError::Permanent(format!(
                "metadata format '{}' is not configured",
                hc.metadata_format
            ))
        })?;

    let identify = ctx.client.identify(&hc.oai_source).await?;
    let prefixes = resolve_prefixes(ctx, hc, format).await?;

    let (from, until) = harvest_window(
        hc.last_harvested,
        &started,
        harvester.time_padding_secs,
        identify.granularity,
    )?;
    info!(
        from = from.as_deref().unwrap_or("-"),
        until = %until,
        set = hc.set_spec().unwrap_or("all"),
        prefix = %prefixes.metadata,
        "Starting harvest"
    );

    let deadline = TimeDelta::try_hours(harvester.cycle_timeout_hours)
        .and_then(|limit| started.checked_add_signed(limit))
        .ok_or_else(|| {
            ConfigError::Invalid(format!(
                "harvester.cycle_timeout_hours {} is out of range",
                harvester.cycle_timeout_hours
            ))
        })?;
    let mut request = ListRecordsRequest::Initial {
        prefix: prefixes.metadata.clone(),
        from,
        until: Some(until),
        set: hc.set_spec().map(str::to_string),
    };
    let mut summary = HarvestSummary::default();
    let mut seen: u64 = 0;

    loop {
        let page = match ctx.client.list_records(&hc.oai_source, &request).await {
            Ok(page) => page,
            Err(e) if e.protocol_code() == Some("noRecordsMatch") => {
                if seen == 0 {
                    info!("{}", NO_UPDATES_MESSAGE);
                    summary.message = NO_UPDATES_MESSAGE.to_string();
                    return Ok(summary);
                }
                break;
            }
            Err(e) => return Err(e),
        };

        for record in &page.records {
            if Utc::now() > deadline {
                return Err(HarvestError::Transient(format!(
                    "Harvest cycle exceeded {} hours and was abandoned",
                    harvester.cycle_timeout_hours
                )));
            }
            seen += 1;
            let total = page.resumption.complete_list_size.unwrap_or(seen).max(seen);
            store::set_message(
                &ctx.pool,
                &hc.collection_id,
                &format!(
                    "Collection is currently being harvested (item {} of {})",
                    seen, total
                ),
            )
            .await?;

            match process_record(ctx, hc, format, &prefixes, record).await? {
                RecordOutcome::Imported => summary.imported += 1,
                RecordOutcome::Deleted => summary.deleted += 1,
                RecordOutcome::Skipped => summary.skipped += 1,
            }
        }

        // Each page becomes visible in the index as a unit.
        ctx.index.commit().await.map_err(index_error)?;

        match page.next_token() {
            Some(token) => request = ListRecordsRequest::Resume(token.to_string()),
            None => break,
        }
    }

    summary.message = format!("Imported {} records with success", summary.imported);
    info!(
        imported = summary.imported,
        deleted = summary.deleted,
        skipped = summary.skipped,
        "Harvest finished"
    );
    Ok(summary)
}

async fn resolve_prefixes(
    ctx: &HarvestContext,
    hc: &HarvestedCollection,
    format: &MetadataFormatConfig,
) -> Result<Prefixes, HarvestError> {
    let formats = ctx.client.list_metadata_formats(&hc.oai_source).await?;
    let prefix_for = |namespace: &str| {
        formats
            .iter()
            .find(|f| f.namespace.trim() == namespace)
            .map(|f| f.prefix.clone())
    };

    let metadata = prefix_for(&format.namespace).ok_or_else(|| {
        HarvestError::Permanent(format!(
            "The OAI server does not support this metadata format: {}",
            format.namespace
        ))
    })?;

    let ore = if hc.harvest_type.needs_ore() {
        let ns = &ctx.config.ore.namespace;
        Some(prefix_for(ns).ok_or_else(|| {
            HarvestError::Permanent(format!(
                "The OAI server does not support ORE dissemination in the configured serialization format: {}",
                ns
            ))
        })?)
    } else {
        None
    };

    Ok(Prefixes { metadata, ore })
}

async fn process_record(
    ctx: &HarvestContext,
    hc: &HarvestedCollection,
    format: &MetadataFormatConfig,
    prefixes: &Prefixes,
    record: &Record,
) -> Result<RecordOutcome, HarvestError> {
    let oai_id = &record.header.identifier;
    let existing = {
        let mut conn = ctx.pool.acquire().await?;
        store::find_harvested_item(&mut conn, &hc.collection_id, oai_id).await?
    };

    if record.header.deleted {
        let Some(existing) = existing else {
            debug!(oai_id, "Deleted upstream, not held locally");
            return Ok(RecordOutcome::Skipped);
        };
        info!(oai_id, item = %existing.item_id, "Deleted upstream, removing local item");
        let mut conn = ctx.pool.acquire().await?;
        store::delete_item(&mut conn, &existing.item_id).await?;
        ctx.index
            .delete(&existing.item_id)
            .await
            .map_err(index_error)?;
        return Ok(RecordOutcome::Deleted);
    }

    if let (Some(existing), Some(datestamp)) = (&existing, record.header.datestamp) {
        if existing.harvest_date.is_some_and(|harvested| datestamp < harvested) {
            info!(oai_id, "Harvested more recently than the remote datestamp, skipping");
            return Ok(RecordOutcome::Skipped);
        }
    }

    let metadata = record.metadata.as_ref().ok_or_else(|| {
        HarvestError::Permanent(format!("record {} carries no metadata", oai_id))
    })?;
    let values = crosswalk::restrict_to_schema(
        crosswalk::metadata_values(metadata, format),
        &ctx.schema,
        ctx.config.schema.strict,
    )?;

    // Remote fetches happen before the transaction opens.
    let mut ore_xml = None;
    let mut files = Vec::new();
    if let Some(ore_prefix) = &prefixes.ore {
        let ore = ctx
            .client
            .get_record(&hc.oai_source, oai_id, ore_prefix)
            .await?;
        if hc.harvest_type == HarvestType::Full {
            if let Some(map) = &ore.metadata {
                for resource in crosswalk::ore_aggregates(map) {
                    debug!(oai_id, url = %resource.url, "Fetching aggregated resource");
                    let content = ctx.client.fetch(&resource.url).await?;
                    files.push(Bitstream {
                        bundle: CONTENT_BUNDLE.to_string(),
                        name: resource.name,
                        content,
                    });
                }
            }
        }
        ore_xml = Some(ore.metadata_xml.ok_or_else(|| {
            HarvestError::Permanent(format!("ORE record for {} carries no resource map", oai_id))
        })?);
    }

    let existing_handle = match &existing {
        Some(existing) => load_handle(&ctx.pool, &existing.item_id).await?,
        None => None,
    };

    let now = Utc::now().trunc_subsecs(0);
    let mut tx = ctx.pool.begin().await?;

    let item = match &existing {
        Some(existing) => {
            let mut item = Item {
                id: existing.item_id.clone(),
                collection_id: hc.collection_id.clone(),
                handle: existing_handle,
                last_modified: now,
                metadata: values,
            };
            item.metadata
                .push(crosswalk::provenance(false, &hc.oai_source, oai_id, &now));
            store::update_item(&mut tx, &item).await?;
            item
        }
        None => {
            let handle = crosswalk::extract_handle(&values, &ctx.config.harvester);
            if let Some(handle) = &handle {
                if store::find_item_by_handle(&mut tx, handle).await?.is_some() {
                    return Err(HarvestError::Permanent(format!(
                        "Handle collision: attempted to re-assign handle '{}' to an incoming harvested item '{}'.",
                        handle, oai_id
                    )));
                }
            }
            let mut item = Item {
                id: uuid::Uuid::new_v4().to_string(),
                collection_id: hc.collection_id.clone(),
                handle,
                last_modified: now,
                metadata: values,
            };
            item.metadata
                .push(crosswalk::provenance(true, &hc.oai_source, oai_id, &now));
            store::insert_item(&mut tx, &item).await?;
            item
        }
    };

    if hc.harvest_type == HarvestType::Full {
        store::delete_bitstreams(&mut tx, &item.id, CONTENT_BUNDLE).await?;
        for file in &files {
            store::put_bitstream(&mut tx, &item.id, file).await?;
        }
    }
    if let Some(xml) = ore_xml {
        let ore = Bitstream {
            bundle: ORE_BUNDLE.to_string(),
            name: ORE_BITSTREAM.to_string(),
            content: xml.into_bytes(),
        };
        store::put_bitstream(&mut tx, &item.id, &ore).await?;
    }

    store::upsert_harvested_item(
        &mut tx,
        &HarvestedItem {
            item_id: item.id.clone(),
            collection_id: hc.collection_id.clone(),
            oai_id: oai_id.clone(),
            harvest_date: Some(now),
        },
    )
    .await?;
    tx.commit().await?;

    if exposure::is_exposed(ctx.exposure.as_deref(), &item) {
        ctx.index
            .submit(IndexDocument::from_item(&item))
            .await
            .map_err(index_error)?;
    } else {
        debug!(oai_id, item = %item.id, "Hidden by exposure filter, not indexed");
        ctx.index.delete(&item.id).await.map_err(index_error)?;
    }
    debug!(oai_id, item = %item.id, handle = ?item.handle, "Ingested record");
    Ok(RecordOutcome::Imported)
}

async fn load_handle(pool: &SqlitePool, item_id: &str) -> Result<Option<String>, HarvestError> {
    Ok(store::load_item(pool, item_id)
        .await?
        .and_then(|item| item.handle))
}

/// Write a finished cycle's result back to the collection row.
///
/// | Result | Status | Failure count |
/// |--------|--------|---------------|
/// | success | READY, `last_harvested` = cycle start | cleared |
/// | interrupted | READY | unchanged |
/// | transient | OAI_ERROR | unchanged |
/// | permanent | OAI_ERROR | +1 |
pub async fn record_outcome(
    pool: &SqlitePool,
    collection_id: &str,
    started: &DateTime<Utc>,
    result: &Result<HarvestSummary, HarvestError>,
) -> Result<(), sqlx::Error> {
    let applied = match result {
        Ok(summary) => store::complete(pool, collection_id, started, &summary.message).await?,
        Err(HarvestError::Interrupted(message)) => {
            store::interrupt(pool, collection_id, message).await?
        }
        Err(e) => {
            warn!(collection = collection_id, error = %e, "Harvest failed");
            store::fail(pool, collection_id, &e.to_string(), !e.is_transient()).await?
        }
    };
    if !applied {
        warn!(
            collection = collection_id,
            "Collection left BUSY before its outcome was recorded"
        );
    }
    Ok(())
}

/// The `from` and `until` arguments for a cycle starting at `started`.
pub fn harvest_window(
    last_harvested: Option<DateTime<Utc>>,
    started: &DateTime<Utc>,
    padding_secs: i64,
    granularity: Granularity,
) -> Result<(Option<String>, String), ConfigError> {
    let from = match last_harvested {
        Some(last) => {
            let padded = TimeDelta::try_seconds(padding_secs)
                .and_then(|padding| last.checked_sub_signed(padding))
                .ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "harvester.time_padding_secs {} is out of range",
                        padding_secs
                    ))
                })?;
            Some(granularity.format(&padded))
        }
        None => None,
    };
    Ok((from, granularity.format(started)))
}
