//! Mapping from harvested XML to local item content.
//!
//! Descriptive metadata: every child element of the record's metadata
//! root becomes `<schema>.<element>`. DSpace intermediate metadata
//! (`<dim:field mdschema="dc" element="title" qualifier="alternative">`)
//! is understood too, so qualified fields survive a DSpace-to-DSpace
//! harvest.
//!
//! ORE resource maps (Atom serialization) list the aggregated files of an
//! item as `<link rel=".../ore/terms/aggregates" href="..."/>`.

use chrono::{DateTime, Utc};

use crate::config::{HarvesterConfig, MetadataFormatConfig};
use crate::error::HarvestError;
use crate::filter::Schema;
use crate::models::{format_ts, MetadataValue};
use crate::oai::Element;

pub const PROVENANCE_FIELD: &str = "dc.description.provenance";
const IDENTIFIER_FIELD: &str = "dc.identifier";
const ORE_AGGREGATES: &str = "http://www.openarchives.org/ore/terms/aggregates";

/// Flatten a metadata record into ordered field/value pairs.
pub fn metadata_values(record: &Element, format: &MetadataFormatConfig) -> Vec<MetadataValue> {
    let mut values = Vec::new();
    for child in &record.children {
        let field = match (child.name.as_str(), child.attr("element")) {
            ("field", Some(element)) => {
                let schema = child.attr("mdschema").unwrap_or(&format.schema);
                match child.attr("qualifier").filter(|q| !q.is_empty()) {
                    Some(q) => format!("{}.{}.{}", schema, element, q),
                    None => format!("{}.{}", schema, element),
                }
            }
            (name, _) => format!("{}.{}", format.schema, name),
        };
        let value = child.text.trim();
        // Blank values are not stored, so "field exists" means "has a value".
        if !value.is_empty() {
            values.push(MetadataValue::new(field, value));
        }
    }
    values
}

/// Drop (or, when `strict`, reject) values whose field is not in `schema`.
pub fn restrict_to_schema(
    values: Vec<MetadataValue>,
    schema: &Schema,
    strict: bool,
) -> Result<Vec<MetadataValue>, HarvestError> {
    let mut kept = Vec::with_capacity(values.len());
    for mv in values {
        if schema.contains(&mv.field) {
            kept.push(mv);
        } else if strict {
            return Err(HarvestError::Permanent(format!(
                "metadata field '{}' is not in the schema",
                mv.field
            )));
        }
    }
    Ok(kept)
}

/// Pick a handle out of `dc.identifier` URLs such as
/// `http://hdl.handle.net/1234/56`, if the server is accepted and the
/// prefix is not rejected.
pub fn extract_handle(values: &[MetadataValue], config: &HarvesterConfig) -> Option<String> {
    values
        .iter()
        .filter(|mv| mv.field == IDENTIFIER_FIELD || mv.field.starts_with("dc.identifier."))
        .find_map(|mv| {
            let pieces: Vec<&str> = mv.value.split('/').collect();
            if pieces.len() != 5 {
                return None;
            }
            let (server, prefix, suffix) = (pieces[2], pieces[3], pieces[4]);
            let accepted = config
                .accepted_handle_servers
                .iter()
                .any(|s| s == server);
            let rejected = config
                .rejected_handle_prefixes
                .iter()
                .any(|p| p == prefix);
            (accepted && !rejected && !suffix.is_empty()).then(|| format!("{}/{}", prefix, suffix))
        })
}

pub fn provenance(
    created: bool,
    source: &str,
    oai_id: &str,
    harvested_at: &DateTime<Utc>,
) -> MetadataValue {
    let verb = if created { "created" } else { "updated" };
    MetadataValue::new(
        PROVENANCE_FIELD,
        format!(
            "Item {} via OAI harvest from source: {} on {} (GMT).  Item's OAI Record identifier: {}",
            verb,
            source,
            format_ts(harvested_at),
            oai_id
        ),
    )
}

/// A file aggregated by an ORE resource map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedResource {
    pub url: String,
    pub name: String,
    pub mime_type: Option<String>,
}

pub fn ore_aggregates(resource_map: &Element) -> Vec<AggregatedResource> {
    resource_map
        .children_named("link")
        .filter(|link| link.attr("rel") == Some(ORE_AGGREGATES))
        .filter_map(|link| {
            let url = link.attr("href")?.to_string();
            let name = link
                .attr("title")
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .or_else(|| {
                    url.split('?')
                        .next()
                        .and_then(|path| path.rsplit('/').next())
                        .filter(|seg| !seg.is_empty())
                        .map(str::to_string)
                })?;
            Some(AggregatedResource {
                url,
                name,
                mime_type: link.attr("type").map(str::to_string),
            })
        })
        .collect()
}
