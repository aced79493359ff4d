//! Core data models used throughout the harvester.
//!
//! Items and their metadata are what filters evaluate; harvested
//! collections and harvested items are the bookkeeping rows the scheduler
//! and the harvest cycle mutate.

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use std::fmt;
use std::str::FromStr;

use crate::status::HarvestStatus;

/// Timestamp layout used in storage, in search queries and on the wire.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Format a timestamp in UTC at second precision.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp. Accepts RFC 3339 with any offset (normalized to UTC),
/// `YYYY-MM-DDTHH:MM:SSZ`, and bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc).trunc_subsecs(0));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT) {
        return Some(naive.and_utc());
    }
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// A single metadata value on an item, e.g. `dc.title = "Physics Today"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataValue {
    pub field: String,
    pub value: String,
}

impl MetadataValue {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// A local repository item.
#[derive(Debug, Clone)]
pub struct Item {
    pub id: String,
    pub collection_id: String,
    pub handle: Option<String>,
    /// Always second precision, UTC.
    pub last_modified: DateTime<Utc>,
    /// Ordered by place.
    pub metadata: Vec<MetadataValue>,
}

impl Item {
    pub fn values<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.metadata
            .iter()
            .filter(move |mv| mv.field == field)
            .map(|mv| mv.value.as_str())
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.values(field).next().is_some()
    }
}

/// A stored file attached to an item.
#[derive(Debug, Clone)]
pub struct Bitstream {
    pub bundle: String,
    pub name: String,
    pub content: Vec<u8>,
}

/// What a harvest cycle pulls from the remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestType {
    /// Descriptive metadata only.
    Metadata,
    /// Metadata plus the ORE resource map, stored as `ORE.xml`.
    MetadataRef,
    /// Metadata, resource map, and every aggregated file.
    Full,
}

impl HarvestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HarvestType::Metadata => "metadata",
            HarvestType::MetadataRef => "metadata-ref",
            HarvestType::Full => "full",
        }
    }

    pub fn needs_ore(&self) -> bool {
        !matches!(self, HarvestType::Metadata)
    }
}

impl fmt::Display for HarvestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HarvestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metadata" | "1" => Ok(HarvestType::Metadata),
            "metadata-ref" | "2" => Ok(HarvestType::MetadataRef),
            "full" | "3" => Ok(HarvestType::Full),
            other => Err(format!(
                "unknown harvest type '{}'. Use metadata, metadata-ref, or full.",
                other
            )),
        }
    }
}

/// A remote OAI-PMH endpoint bound to a local collection.
#[derive(Debug, Clone)]
pub struct HarvestedCollection {
    pub collection_id: String,
    pub oai_source: String,
    /// `"all"` harvests without a set restriction.
    pub oai_set_id: String,
    /// Key into `[metadata_formats]`.
    pub metadata_format: String,
    pub harvest_type: HarvestType,
    pub status: HarvestStatus,
    /// Start time of the last successful cycle.
    pub last_harvested: Option<DateTime<Utc>>,
    pub harvest_start_time: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub consecutive_failures: u32,
}

impl HarvestedCollection {
    pub fn set_spec(&self) -> Option<&str> {
        if self.oai_set_id == "all" || self.oai_set_id.is_empty() {
            None
        } else {
            Some(&self.oai_set_id)
        }
    }
}

/// Maps a local item to the remote record it was harvested from.
#[derive(Debug, Clone)]
pub struct HarvestedItem {
    pub item_id: String,
    pub collection_id: String,
    pub oai_id: String,
    pub harvest_date: Option<DateTime<Utc>>,
}
