//! OAI-PMH 2.0 response parsing.
//!
//! Every verb's response is wrapped in the same `<OAI-PMH>` envelope. An
//! `<error>` child turns into [`HarvestError::Protocol`]; anything that is
//! not an OAI-PMH document at all is a permanent failure.

use chrono::{DateTime, Utc};

use crate::error::HarvestError;
use crate::models::{format_ts, parse_ts};

use super::xml::{parse_document, Element};

/// Datestamp granularity advertised by `Identify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Day,
    Seconds,
}

impl Granularity {
    pub fn parse(value: &str) -> Self {
        if value.trim() == "YYYY-MM-DD" {
            Granularity::Day
        } else {
            Granularity::Seconds
        }
    }

    /// Format `ts` at this granularity for `from` / `until` arguments.
    pub fn format(&self, ts: &DateTime<Utc>) -> String {
        match self {
            Granularity::Day => ts.format("%Y-%m-%d").to_string(),
            Granularity::Seconds => format_ts(ts),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Identify {
    pub repository_name: String,
    pub base_url: String,
    pub protocol_version: String,
    pub granularity: Granularity,
    pub earliest_datestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFormat {
    pub prefix: String,
    pub namespace: String,
    pub schema: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OaiSet {
    pub spec: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct RecordHeader {
    pub identifier: String,
    pub datestamp: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub set_specs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Record {
    pub header: RecordHeader,
    /// The single element inside `<metadata>`.
    pub metadata: Option<Element>,
    /// Original markup of `metadata`.
    pub metadata_xml: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ResumptionToken {
    pub token: Option<String>,
    pub complete_list_size: Option<u64>,
    pub cursor: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    pub records: Vec<Record>,
    pub resumption: ResumptionToken,
}

impl RecordPage {
    /// Token for the next page; an empty token ends the list.
    pub fn next_token(&self) -> Option<&str> {
        self.resumption
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
    }
}

/// Parse the envelope and return the verb element (e.g. `<ListRecords>`).
fn verb_element(root: Element, verb: &str) -> Result<Element, HarvestError> {
    if root.name != "OAI-PMH" {
        return Err(HarvestError::Permanent(format!(
            "not an OAI-PMH response (root element '{}')",
            root.name
        )));
    }
    if let Some(error) = root.child("error") {
        return Err(HarvestError::Protocol {
            code: error.attr("code").unwrap_or("unknown").to_string(),
            message: error.text.clone(),
        });
    }
    root.children
        .into_iter()
        .find(|c| c.name == verb)
        .ok_or_else(|| HarvestError::Permanent(format!("OAI-PMH response has no <{}> element", verb)))
}

pub fn parse_identify(bytes: &[u8]) -> Result<Identify, HarvestError> {
    let identify = verb_element(parse_document(bytes)?, "Identify")?;
    let text = |name: &str| identify.child_text(name).unwrap_or_default().to_string();
    Ok(Identify {
        repository_name: text("repositoryName"),
        base_url: text("baseURL"),
        protocol_version: text("protocolVersion"),
        granularity: Granularity::parse(&text("granularity")),
        earliest_datestamp: identify.child_text("earliestDatestamp").map(str::to_string),
    })
}

pub fn parse_metadata_formats(bytes: &[u8]) -> Result<Vec<MetadataFormat>, HarvestError> {
    let list = verb_element(parse_document(bytes)?, "ListMetadataFormats")?;
    Ok(list
        .children_named("metadataFormat")
        .map(|f| MetadataFormat {
            prefix: f.child_text("metadataPrefix").unwrap_or_default().to_string(),
            namespace: f
                .child_text("metadataNamespace")
                .unwrap_or_default()
                .to_string(),
            schema: f.child_text("schema").map(str::to_string),
        })
        .collect())
}

pub fn parse_sets(bytes: &[u8]) -> Result<(Vec<OaiSet>, ResumptionToken), HarvestError> {
    let list = verb_element(parse_document(bytes)?, "ListSets")?;
    let sets = list
        .children_named("set")
        .map(|s| OaiSet {
            spec: s.child_text("setSpec").unwrap_or_default().to_string(),
            name: s.child_text("setName").unwrap_or_default().to_string(),
        })
        .collect();
    Ok((sets, parse_resumption(&list)))
}

pub fn parse_list_records(bytes: &[u8]) -> Result<RecordPage, HarvestError> {
    let list = verb_element(parse_document(bytes)?, "ListRecords")?;
    let records = list
        .children_named("record")
        .map(|r| parse_record(r, bytes))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RecordPage {
        records,
        resumption: parse_resumption(&list),
    })
}

pub fn parse_get_record(bytes: &[u8]) -> Result<Record, HarvestError> {
    let get = verb_element(parse_document(bytes)?, "GetRecord")?;
    let record = get
        .child("record")
        .ok_or_else(|| HarvestError::Permanent("GetRecord response has no <record>".into()))?;
    parse_record(record, bytes)
}

fn parse_record(record: &Element, source: &[u8]) -> Result<Record, HarvestError> {
    let header = record
        .child("header")
        .ok_or_else(|| HarvestError::Permanent("record without <header>".into()))?;
    let identifier = header
        .child_text("identifier")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| HarvestError::Permanent("record header without <identifier>".into()))?;

    let metadata = record
        .child("metadata")
        .and_then(|m| m.children.first())
        .cloned();
    let metadata_xml = metadata
        .as_ref()
        .map(|m| String::from_utf8_lossy(m.raw(source)).into_owned());

    Ok(Record {
        header: RecordHeader {
            identifier: identifier.to_string(),
            datestamp: header.child_text("datestamp").and_then(parse_ts),
            deleted: header.attr("status") == Some("deleted"),
            set_specs: header
                .children_named("setSpec")
                .map(|s| s.text.clone())
                .collect(),
        },
        metadata,
        metadata_xml,
    })
}

fn parse_resumption(list: &Element) -> ResumptionToken {
    match list.child("resumptionToken") {
        Some(t) => ResumptionToken {
            token: Some(t.text.clone()),
            complete_list_size: t.attr("completeListSize").and_then(|v| v.parse().ok()),
            cursor: t.attr("cursor").and_then(|v| v.parse().ok()),
        },
        None => ResumptionToken::default(),
    }
}
