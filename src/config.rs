//! TOML configuration.
//!
//! Read once at startup and shared behind an `Arc`; nothing here is
//! re-read while a harvest cycle is running.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::filter::{FilterRegistry, FilterSet, Schema};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub harvester: HarvesterConfig,
    #[serde(default = "default_metadata_formats")]
    pub metadata_formats: BTreeMap<String, MetadataFormatConfig>,
    #[serde(default)]
    pub ore: OreConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub oai: OaiConfig,
    #[serde(default)]
    pub filters: BTreeMap<String, FilterConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HarvesterConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_time_padding_secs")]
    pub time_padding_secs: i64,
    #[serde(default = "default_cycle_timeout_hours")]
    pub cycle_timeout_hours: i64,
    #[serde(default = "default_accepted_handle_servers")]
    pub accepted_handle_servers: Vec<String>,
    #[serde(default = "default_rejected_handle_prefixes")]
    pub rejected_handle_prefixes: Vec<String>,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            workers: default_workers(),
            request_timeout_secs: default_request_timeout_secs(),
            failure_threshold: default_failure_threshold(),
            time_padding_secs: default_time_padding_secs(),
            cycle_timeout_hours: default_cycle_timeout_hours(),
            accepted_handle_servers: default_accepted_handle_servers(),
            rejected_handle_prefixes: default_rejected_handle_prefixes(),
        }
    }
}

impl HarvesterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// One week.
pub const MAX_TIME_PADDING_SECS: i64 = 7 * 24 * 60 * 60;
/// One year.
pub const MAX_CYCLE_TIMEOUT_HOURS: i64 = 365 * 24;

fn default_interval_secs() -> u64 {
    300
}
fn default_workers() -> usize {
    3
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_time_padding_secs() -> i64 {
    120
}
fn default_cycle_timeout_hours() -> i64 {
    24
}
fn default_accepted_handle_servers() -> Vec<String> {
    vec!["hdl.handle.net".to_string()]
}
fn default_rejected_handle_prefixes() -> Vec<String> {
    vec!["123456789".to_string()]
}

/// A metadata format the harvester can ingest, keyed by its local name
/// (e.g. `oai_dc`). The remote prefix is resolved from `namespace`.
#[derive(Debug, Deserialize, Clone)]
pub struct MetadataFormatConfig {
    pub namespace: String,
    /// Schema prefix given to ingested field names (`dc` → `dc.title`).
    #[serde(default = "default_schema_prefix")]
    pub schema: String,
}

fn default_schema_prefix() -> String {
    "dc".to_string()
}

fn default_metadata_formats() -> BTreeMap<String, MetadataFormatConfig> {
    let mut formats = BTreeMap::new();
    formats.insert(
        "oai_dc".to_string(),
        MetadataFormatConfig {
            namespace: "http://www.openarchives.org/OAI/2.0/oai_dc/".to_string(),
            schema: default_schema_prefix(),
        },
    );
    formats
}

#[derive(Debug, Deserialize, Clone)]
pub struct OreConfig {
    #[serde(default = "default_ore_namespace")]
    pub namespace: String,
}

impl Default for OreConfig {
    fn default() -> Self {
        Self {
            namespace: default_ore_namespace(),
        }
    }
}

fn default_ore_namespace() -> String {
    "http://www.w3.org/2005/Atom".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_backend")]
    pub backend: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_index_backend(),
            url: None,
        }
    }
}

fn default_index_backend() -> String {
    "memory".to_string()
}

/// Metadata fields known to the repository. Filters may only reference
/// these; ingest drops (or, when `strict`, rejects) anything else.
#[derive(Debug, Deserialize, Clone)]
pub struct SchemaConfig {
    #[serde(default = "default_schema_fields")]
    pub fields: Vec<String>,
    #[serde(default)]
    pub strict: bool,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            fields: default_schema_fields(),
            strict: false,
        }
    }
}

fn default_schema_fields() -> Vec<String> {
    [
        "contributor",
        "coverage",
        "creator",
        "date",
        "description",
        "description.provenance",
        "format",
        "identifier",
        "language",
        "publisher",
        "relation",
        "rights",
        "source",
        "subject",
        "title",
        "type",
    ]
    .iter()
    .map(|element| format!("dc.{}", element))
    .collect()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OaiConfig {
    /// Filter deciding which local items are exposed via OAI-PMH.
    #[serde(default)]
    pub exposure_filter: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    pub kind: String,
    #[serde(default)]
    pub params: Vec<String>,
}

impl Config {
    pub fn filter_schema(&self) -> Schema {
        Schema::new(self.schema.fields.iter().cloned())
    }

    /// Construct every `[filters.<name>]` entry with the built-in kinds.
    pub fn build_filters(&self) -> Result<FilterSet> {
        FilterRegistry::builtin()
            .build(&self.filters, &self.filter_schema())
            .context("Invalid filter configuration")
    }

    /// A config with defaults everywhere except the database path.
    pub fn minimal(db_path: PathBuf) -> Self {
        Self {
            db: DbConfig { path: db_path },
            harvester: HarvesterConfig::default(),
            metadata_formats: default_metadata_formats(),
            ore: OreConfig::default(),
            index: IndexConfig::default(),
            schema: SchemaConfig::default(),
            oai: OaiConfig::default(),
            filters: BTreeMap::new(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.harvester.workers == 0 {
        anyhow::bail!("harvester.workers must be >= 1");
    }
    if config.harvester.failure_threshold == 0 {
        anyhow::bail!("harvester.failure_threshold must be >= 1");
    }
    if config.harvester.request_timeout_secs == 0 {
        anyhow::bail!("harvester.request_timeout_secs must be > 0");
    }
    if !(0..=MAX_TIME_PADDING_SECS).contains(&config.harvester.time_padding_secs) {
        anyhow::bail!(
            "harvester.time_padding_secs must be between 0 and {}",
            MAX_TIME_PADDING_SECS
        );
    }
    if !(1..=MAX_CYCLE_TIMEOUT_HOURS).contains(&config.harvester.cycle_timeout_hours) {
        anyhow::bail!(
            "harvester.cycle_timeout_hours must be between 1 and {}",
            MAX_CYCLE_TIMEOUT_HOURS
        );
    }

    if config.metadata_formats.is_empty() {
        anyhow::bail!("at least one [metadata_formats.<name>] entry is required");
    }

    match config.index.backend.as_str() {
        "memory" => {}
        "solr" => {
            if config.index.url.is_none() {
                anyhow::bail!("index.url must be set when backend is 'solr'");
            }
        }
        other => anyhow::bail!(
            "Unknown index backend: '{}'. Must be memory or solr.",
            other
        ),
    }

    if let Some(name) = &config.oai.exposure_filter {
        if !config.filters.contains_key(name) {
            anyhow::bail!("oai.exposure_filter '{}' is not a configured filter", name);
        }
    }

    config.build_filters()?;
    Ok(())
}
