//! Which local items a filter exposes, and the `oaih filter ...` commands.
//!
//! The same filter can be answered three ways: evaluated against a loaded
//! item, run as a storage predicate, or sent to the search index. All
//! three agree; `filter check` shows them side by side for one item.
//!
//! The exposure filter (`[oai] exposure_filter`) also gates the search
//! index: only exposed items are submitted, both during harvest and when
//! the index is rebuilt from the store.

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;
use crate::filter::{Filter, FilterSet, Schema};
use crate::index::{self, IndexDocument, SearchIndex};
use crate::models::Item;
use crate::store;

pub fn schema(config: &Config) -> Schema {
    config.filter_schema()
}

/// Build every configured filter with the built-in kinds.
pub fn load_filters(config: &Config) -> Result<FilterSet> {
    config.build_filters()
}

/// The filter named by `[oai] exposure_filter`, if any.
pub fn exposure_filter(config: &Config, filters: &FilterSet) -> Option<Arc<Filter>> {
    config
        .oai
        .exposure_filter
        .as_deref()
        .and_then(|name| filters.get(name))
}

/// Whether `item` is visible through OAI-PMH. With no exposure filter
/// configured everything is.
pub fn is_exposed(filter: Option<&Filter>, item: &Item) -> bool {
    filter.map_or(true, |f| f.evaluate(item))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildSummary {
    pub indexed: usize,
    pub hidden: usize,
}

/// Resubmit every stored item, skipping (and removing) those the exposure
/// filter hides, then commit once.
pub async fn rebuild_index(
    pool: &SqlitePool,
    index: &dyn SearchIndex,
    exposure: Option<&Filter>,
) -> Result<RebuildSummary> {
    let mut summary = RebuildSummary::default();
    for id in store::list_item_ids(pool).await? {
        let Some(item) = store::load_item(pool, &id).await? else {
            continue;
        };
        if is_exposed(exposure, &item) {
            index.submit(IndexDocument::from_item(&item)).await?;
            summary.indexed += 1;
        } else {
            debug!(item = %item.id, "Hidden by exposure filter");
            index.delete(&item.id).await?;
            summary.hidden += 1;
        }
    }
    index.commit().await?;
    info!(
        indexed = summary.indexed,
        hidden = summary.hidden,
        "Rebuilt search index"
    );
    Ok(summary)
}

/// Open the configured index for a command. The memory backend starts
/// empty in every process, so it is repopulated from the store first.
pub async fn open_index(config: &Config, pool: &SqlitePool) -> Result<Arc<dyn SearchIndex>> {
    let index = index::create_index(config)?;
    if config.index.backend == "memory" {
        let filters = load_filters(config)?;
        let gate = exposure_filter(config, &filters);
        rebuild_index(pool, index.as_ref(), gate.as_deref()).await?;
    }
    Ok(index)
}

/// Ids of stored items the filter matches, sorted ascending.
pub async fn matching_item_ids(
    pool: &SqlitePool,
    filter: &Filter,
    schema: &Schema,
) -> Result<Vec<String>> {
    let predicate = filter.to_storage_predicate(schema)?;
    Ok(store::query_items(pool, &predicate).await?)
}

/// Ids of indexed items the filter matches, sorted ascending.
pub async fn search_item_ids(
    index: &dyn SearchIndex,
    filter: &Filter,
    schema: &Schema,
    limit: usize,
) -> Result<Vec<String>> {
    let query = filter.to_search_query(schema)?;
    index.query(&query, limit).await
}

fn require(filters: &FilterSet, name: &str) -> Result<Arc<Filter>> {
    match filters.get(name) {
        Some(f) => Ok(f),
        None => bail!(
            "no filter named '{}'. Configured: {}",
            name,
            filters.names().collect::<Vec<_>>().join(", ")
        ),
    }
}

pub fn show_filters(config: &Config) -> Result<()> {
    let filters = load_filters(config)?;
    let schema = schema(config);
    if filters.is_empty() {
        println!("No filters configured.");
        return Ok(());
    }

    for name in filters.names() {
        let filter = require(&filters, name)?;
        let kind = config
            .filters
            .get(name)
            .map(|d| d.kind.as_str())
            .unwrap_or("?");
        let predicate = filter.to_storage_predicate(&schema)?;
        let marker = if config.oai.exposure_filter.as_deref() == Some(name) {
            "  (exposure filter)"
        } else {
            ""
        };

        println!("{} [{}]{}", name, kind, marker);
        println!("  params: {}", filter.params().join(", "));
        println!("  sql:    {}", predicate.template);
        println!("  binds:  {:?}", predicate.params);
        println!("  solr:   {}", filter.to_search_query(&schema)?);
        println!();
    }
    Ok(())
}

pub async fn list_filter_items(config: &Config, pool: &SqlitePool, name: &str) -> Result<()> {
    let filters = load_filters(config)?;
    let filter = require(&filters, name)?;
    let ids = matching_item_ids(pool, &filter, &schema(config)).await?;
    for id in &ids {
        println!("{}", id);
    }
    eprintln!("{} item(s) match '{}'", ids.len(), name);
    Ok(())
}

/// Same as [`list_filter_items`] but answered by the search index.
pub async fn search_filter_items(
    config: &Config,
    index: &dyn SearchIndex,
    name: &str,
    limit: usize,
) -> Result<()> {
    let filters = load_filters(config)?;
    let filter = require(&filters, name)?;
    let ids = search_item_ids(index, &filter, &schema(config), limit).await?;
    for id in &ids {
        println!("{}", id);
    }
    eprintln!("{} indexed item(s) match '{}'", ids.len(), name);
    Ok(())
}

pub async fn check_item(
    config: &Config,
    pool: &SqlitePool,
    name: &str,
    item_id: &str,
) -> Result<()> {
    let filters = load_filters(config)?;
    let filter = require(&filters, name)?;
    let Some(item) = store::load_item(pool, item_id).await? else {
        bail!("item not found: {}", item_id);
    };

    let evaluated = filter.evaluate(&item);
    let stored = matching_item_ids(pool, &filter, &schema(config))
        .await?
        .iter()
        .any(|id| id == item_id);

    println!("Item:       {}", item.id);
    println!("Filter:     {}", name);
    println!("Evaluated:  {}", evaluated);
    println!("Storage:    {}", stored);
    if evaluated != stored {
        bail!("in-memory and storage results disagree for item {}", item_id);
    }
    Ok(())
}
