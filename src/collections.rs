//! Administration of harvested collections (`oaih collection ...`).
//!
//! Collections are never deleted; `disable` takes one out of scheduling
//! and `enable` puts it back as READY.

use anyhow::{bail, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::models::{format_ts, HarvestType, HarvestedCollection};
use crate::oai::OaiClient;
use crate::status::HarvestStatus;
use crate::store;

pub struct NewCollection {
    pub collection_id: String,
    pub oai_source: String,
    pub oai_set_id: String,
    pub metadata_format: String,
    pub harvest_type: HarvestType,
}

pub async fn add_collection(config: &Config, pool: &SqlitePool, new: NewCollection) -> Result<()> {
    if !config.metadata_formats.contains_key(&new.metadata_format) {
        bail!(
            "metadata format '{}' is not configured. Known formats: {}",
            new.metadata_format,
            config
                .metadata_formats
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    if store::get_collection(pool, &new.collection_id).await?.is_some() {
        bail!("collection '{}' is already configured", new.collection_id);
    }

    let hc = HarvestedCollection {
        collection_id: new.collection_id,
        oai_source: new.oai_source,
        oai_set_id: new.oai_set_id,
        metadata_format: new.metadata_format,
        harvest_type: new.harvest_type,
        status: HarvestStatus::Ready,
        last_harvested: None,
        harvest_start_time: None,
        message: None,
        consecutive_failures: 0,
    };
    store::insert_collection(pool, &hc).await?;
    println!(
        "Added collection {} <- {} (set: {}, format: {}, type: {})",
        hc.collection_id, hc.oai_source, hc.oai_set_id, hc.metadata_format, hc.harvest_type
    );
    Ok(())
}

/// Check that `source` answers Identify, disseminates the configured
/// metadata format, and (unless `set` is `all`) knows the set. Returns
/// one message per problem found.
pub async fn verify_source(
    config: &Config,
    client: &dyn OaiClient,
    source: &str,
    set: &str,
    metadata_format: &str,
) -> Vec<String> {
    let mut problems = Vec::new();

    if let Err(e) = client.identify(source).await {
        problems.push(format!("OAI server did not respond to Identify: {}", e));
        return problems;
    }

    match (
        config.metadata_formats.get(metadata_format),
        client.list_metadata_formats(source).await,
    ) {
        (None, _) => problems.push(format!(
            "metadata format '{}' is not configured",
            metadata_format
        )),
        (Some(_), Err(e)) => problems.push(format!("ListMetadataFormats failed: {}", e)),
        (Some(format), Ok(formats)) => {
            if !formats.iter().any(|f| f.namespace.trim() == format.namespace) {
                problems.push(format!(
                    "The OAI server does not support this metadata format: {}",
                    format.namespace
                ));
            }
        }
    }

    if set != "all" {
        match client.list_sets(source).await {
            Ok(sets) if sets.iter().any(|s| s.spec == set) => {}
            Ok(_) => problems.push(format!("The OAI server does not have a set '{}'", set)),
            Err(e) => problems.push(format!("ListSets failed: {}", e)),
        }
    }

    problems
}

pub async fn list_collections(pool: &SqlitePool) -> Result<()> {
    let collections = store::list_collections(pool).await?;
    if collections.is_empty() {
        println!("No harvested collections configured.");
        return Ok(());
    }

    println!(
        "{:<20} {:<10} {:>5}  {:<20}  {}",
        "COLLECTION", "STATUS", "FAILS", "LAST HARVESTED", "SOURCE"
    );
    println!("{}", "-".repeat(90));
    for hc in &collections {
        println!(
            "{:<20} {:<10} {:>5}  {:<20}  {} [{}]",
            hc.collection_id,
            hc.status,
            hc.consecutive_failures,
            hc.last_harvested
                .as_ref()
                .map(format_ts)
                .unwrap_or_else(|| "never".to_string()),
            hc.oai_source,
            hc.oai_set_id
        );
    }
    Ok(())
}

pub async fn show_collection(pool: &SqlitePool, id: &str) -> Result<()> {
    let Some(hc) = store::get_collection(pool, id).await? else {
        bail!("collection '{}' is not configured for harvesting", id);
    };
    let items = store::list_harvested_items(pool, id).await?;
    let ts = |t: &Option<chrono::DateTime<chrono::Utc>>| {
        t.as_ref().map(format_ts).unwrap_or_else(|| "-".to_string())
    };

    println!("Collection:        {}", hc.collection_id);
    println!("Source:            {}", hc.oai_source);
    println!("Set:               {}", hc.oai_set_id);
    println!("Metadata format:   {}", hc.metadata_format);
    println!("Harvest type:      {}", hc.harvest_type);
    println!("Status:            {}", hc.status);
    println!("Failures:          {}", hc.consecutive_failures);
    println!("Last harvested:    {}", ts(&hc.last_harvested));
    println!("Cycle started:     {}", ts(&hc.harvest_start_time));
    println!("Message:           {}", hc.message.as_deref().unwrap_or("-"));
    println!("Harvested items:   {}", items.len());
    Ok(())
}

pub async fn disable_collection(pool: &SqlitePool, id: &str) -> Result<()> {
    require(pool, id).await?;
    store::disable(pool, id).await?;
    println!("Collection {} disabled.", id);
    Ok(())
}

pub async fn enable_collection(pool: &SqlitePool, id: &str) -> Result<()> {
    let hc = require(pool, id).await?;
    if !store::enable(pool, id).await? {
        bail!("collection '{}' is {}, not DISABLED", id, hc.status);
    }
    println!("Collection {} enabled.", id);
    Ok(())
}

pub async fn reset_collection(pool: &SqlitePool, id: &str) -> Result<()> {
    let hc = require(pool, id).await?;
    if !store::reset(pool, id).await? {
        bail!("collection '{}' is {}, not OAI_ERROR", id, hc.status);
    }
    println!(
        "Collection {} reset to READY ({} consecutive failures cleared).",
        id, hc.consecutive_failures
    );
    Ok(())
}

async fn require(pool: &SqlitePool, id: &str) -> Result<HarvestedCollection> {
    match store::get_collection(pool, id).await? {
        Some(hc) => Ok(hc),
        None => bail!("collection '{}' is not configured for harvesting", id),
    }
}

/// Print the sets a remote repository offers.
pub async fn list_remote_sets(client: &dyn OaiClient, source: &str) -> Result<()> {
    let identify = client.identify(source).await?;
    let sets = client.list_sets(source).await?;
    println!("{} ({})", identify.repository_name, identify.base_url);
    println!();
    println!("{:<40} NAME", "SET SPEC");
    for set in &sets {
        println!("{:<40} {}", set.spec, set.name);
    }
    println!();
    println!("{} set(s)", sets.len());
    Ok(())
}
